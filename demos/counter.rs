//! # Counter Example
//!
//! The smallest realm program: a pure `update` over an integer, driven by
//! lines typed on stdin.
//!
//! Run with: `cargo run --example counter`, then type `+`, `-`, `r` or `q`.

use realm::tokio::io::{self, AsyncBufReadExt, BufReader};
use realm::{Model, Next, RuntimeOptions};
use tracing_subscriber::EnvFilter;

struct Counter {
    count: i64,
}

#[derive(Debug)]
enum Msg {
    Increment,
    Decrement,
    Reset,
}

impl Model for Counter {
    type Message = Msg;
    type Flags = ();

    fn init(_: ()) -> Next<Self> {
        Next::Bare(Counter { count: 0 })
    }

    fn update(self, msg: Msg) -> Next<Self> {
        let count = match msg {
            Msg::Increment => self.count + 1,
            Msg::Decrement => self.count - 1,
            Msg::Reset => 0,
        };
        Next::Bare(Counter { count })
    }
}

#[realm::tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut runtime = realm::standard_runtime::<Counter>((), RuntimeOptions::default())?;
    runtime.subscribe(|counter| println!("count: {}", counter.count));
    let handle = runtime.handle();
    let app = realm::tokio::spawn(runtime.run());

    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "+" => handle.send(Msg::Increment),
            "-" => handle.send(Msg::Decrement),
            "r" => handle.send(Msg::Reset),
            "q" => break,
            other => eprintln!("unknown input {other:?}, use +, -, r or q"),
        }
    }

    handle.stop();
    let model = app.await??;
    println!("Final count: {}", model.count);
    Ok(())
}
