//! # Clock Example
//!
//! Subscriptions: a one-second timer, and optionally a WebSocket echo
//! server that every tick is sent to and listened on over one shared
//! connection.
//!
//! Run with: `cargo run --example clock -- wss://ws.postman-echo.com/raw`
//! (the URL is optional)

use realm::tokio::time::sleep;
use realm::{time, websocket, Command, Model, Next, RuntimeOptions, Subscription};
use std::time::{Duration, SystemTime};
use tracing_subscriber::EnvFilter;

struct Clock {
    url: Option<String>,
    now: Option<SystemTime>,
    echoes: Vec<String>,
}

#[derive(Debug)]
enum Msg {
    Tick(SystemTime),
    Echo(String),
}

impl Model for Clock {
    type Message = Msg;
    type Flags = Option<String>;

    fn init(url: Option<String>) -> Next<Self> {
        Next::Bare(Clock {
            url,
            now: None,
            echoes: Vec::new(),
        })
    }

    fn update(self, msg: Msg) -> Next<Self> {
        match msg {
            Msg::Tick(now) => {
                let cmd = match &self.url {
                    Some(url) => websocket::send(url, format!("{:.3}", time::in_minutes(now))),
                    None => Command::none(),
                };
                Next::with(Clock { now: Some(now), ..self }, cmd)
            }
            Msg::Echo(frame) => {
                let mut echoes = self.echoes;
                echoes.push(frame);
                Next::Bare(Clock { echoes, ..self })
            }
        }
    }

    fn subscriptions(&self) -> Subscription<Msg> {
        let echo = match &self.url {
            Some(url) => websocket::listen(url.clone(), Msg::Echo),
            None => Subscription::none(),
        };
        Subscription::batch([time::every(time::SECOND, Msg::Tick), echo])
    }
}

#[realm::tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let url = std::env::args().nth(1);
    let mut runtime = realm::standard_runtime::<Clock>(url, RuntimeOptions::default())?;
    runtime.subscribe(|clock| {
        if let Some(now) = clock.now {
            println!(
                "{:.3} min since epoch, {} echo(es)",
                time::in_minutes(now),
                clock.echoes.len()
            );
        }
    });
    let handle = runtime.handle();
    let app = realm::tokio::spawn(runtime.run());

    sleep(Duration::from_secs(5)).await;
    handle.stop();
    let clock = app.await??;
    for echo in &clock.echoes {
        println!("echo: {echo}");
    }
    Ok(())
}
