//! A small multi-session test harness for [`fixtrunk::engine::Engine`].
//!
//! Reads a JSON document mapping session names to [`SessionConfig`](fixtrunk::engine::SessionConfig)s,
//! registers and connects every one of them, subscribes a handler that prints inbound application
//! messages, and then drives a tiny line-oriented command loop so an operator can `send`/`query`/
//! `disconnect` sessions by name -- the same shape as the multi-session admin tooling this crate
//! grew out of, minus the web front-end.

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use fixtrunk::engine::{Engine, SessionConfig};
use fixtrunk::fix::generated::{MsgType, Tags};
use fixtrunk::fix::{decode, encode::MessageBuilder};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Opts {
    /// Path to a JSON document mapping session names to `SessionConfig`s.
    #[arg(short, long)]
    config: std::path::PathBuf,

    /// Connect every registered session immediately instead of waiting for `connect <name>`.
    #[arg(long)]
    connect_all: bool,

    /// Turn on verbose (debug-level) tracing.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let filter = if opts.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let engine = Engine::new();
    let configs = Engine::load_configs(&opts.config).await?;
    for (name, config) in &configs {
        engine.register_config(name.clone(), config.clone()).await?;
    }

    engine
        .subscribe(Arc::new(|name, msg| {
            println!("[{name}] <- {}", describe_app_message(&msg));
        }))
        .await;

    if opts.connect_all {
        for (name, _) in &configs {
            println!("connecting {name}...");
            engine.connect(name).await?;
        }
    }

    println!("commands: connect <name> | disconnect <name> | send <name> <clordid> | query <name> | list | quit");
    run_command_loop(&engine, &configs).await
}

async fn run_command_loop(engine: &Engine, configs: &[(String, SessionConfig)]) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("quit"), ..) | (Some("exit"), ..) => break,
            (Some("list"), ..) => {
                for (name, config) in configs {
                    println!("{name}: {:?}", config.key);
                }
            }
            (Some("connect"), Some(name), _) => {
                if let Err(e) = engine.connect(name).await {
                    eprintln!("connect failed: {e}");
                }
            }
            (Some("disconnect"), Some(name), _) => {
                if let Err(e) = engine.disconnect(name).await {
                    eprintln!("disconnect failed: {e}");
                }
            }
            (Some("query"), Some(name), _) => match engine.query(name).await {
                Ok(q) => println!(
                    "{name}: status={:?} next_out={} next_in={} peer={:?}",
                    q.status, q.next_out, q.next_in, q.peer_address
                ),
                Err(e) => eprintln!("query failed: {e}"),
            },
            (Some("send"), Some(name), Some(cl_ord_id)) => {
                let builder = sample_order(cl_ord_id);
                if let Err(e) = engine.send(name, builder).await {
                    eprintln!("send failed: {e}");
                }
            }
            (Some(other), ..) => eprintln!("unrecognized command: {other}"),
            (None, ..) => {}
        }
    }

    engine.shutdown().await;
    Ok(())
}

fn sample_order(cl_ord_id: &str) -> MessageBuilder {
    MessageBuilder::new("FIX.4.2", MsgType::ORDER_SINGLE.into())
        .push(Tags::ClOrdID, cl_ord_id.as_bytes())
        .push(Tags::HandlInst, b"1")
        .push(Tags::Side, fixtrunk::fix::generated::Side::BUY.into())
        .push(
            Tags::OrdType,
            fixtrunk::fix::generated::OrdType::LIMIT.into(),
        )
        .push(Tags::Symbol, b"AAPL")
        .push(Tags::OrderQty, b"100")
        .push(Tags::Price, b"10.00")
        .push(
            Tags::TransactTime,
            fixtrunk::fix::encode::formatted_time().as_bytes(),
        )
}

fn describe_app_message(msg: &fixtrunk::fix::mem::MsgBuf) -> String {
    #[derive(Default)]
    struct ClOrdIdOnly<'a> {
        cl_ord_id: Option<&'a [u8]>,
    }
    impl<'a> decode::ParserCallback<'a> for ClOrdIdOnly<'a> {
        fn header(
            &mut self,
            _key: u32,
            _value: &'a [u8],
        ) -> Result<bool, fixtrunk::fix::SessionError> {
            Ok(true)
        }
        fn body(&mut self, key: u32, value: &'a [u8]) -> Result<bool, fixtrunk::fix::SessionError> {
            if let Ok(Tags::ClOrdID) = key.try_into() {
                self.cl_ord_id = Some(value);
            }
            Ok(true)
        }
        fn trailer(
            &mut self,
            _key: u32,
            _value: &'a [u8],
        ) -> Result<bool, fixtrunk::fix::SessionError> {
            Ok(false)
        }
        fn sequence_num(&self) -> u32 {
            0
        }
    }
    let mut cb = ClOrdIdOnly::default();
    let _ = decode::parse(&msg[..], &mut cb);
    match cb.cl_ord_id {
        Some(id) => String::from_utf8_lossy(id).into_owned(),
        None => format!("{msg}"),
    }
}
