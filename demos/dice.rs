//! # Dice Example
//!
//! Synchronous commands: every `Roll` asks the random handler for a face,
//! and the resulting `Face` message is processed inside the same
//! `dispatch` call.
//!
//! Run with: `cargo run --example dice -- 20` (sides, default 6)

use realm::{random, Model, Next, RuntimeOptions};
use tracing_subscriber::EnvFilter;

struct Dice {
    sides: i64,
    face: Option<i64>,
    rolls: u32,
}

#[derive(Debug)]
enum Msg {
    Roll,
    Face(i64),
}

impl Dice {
    fn roll(&self) -> realm::Command<Msg> {
        random::generate(random::int(1, self.sides), Msg::Face)
    }
}

impl Model for Dice {
    type Message = Msg;
    type Flags = i64;

    fn init(sides: i64) -> Next<Self> {
        Next::Bare(Dice {
            sides,
            face: None,
            rolls: 0,
        })
    }

    fn update(self, msg: Msg) -> Next<Self> {
        match msg {
            Msg::Roll => {
                let cmd = self.roll();
                Next::with(self, cmd)
            }
            Msg::Face(face) => Next::Bare(Dice {
                face: Some(face),
                rolls: self.rolls + 1,
                ..self
            }),
        }
    }
}

#[realm::tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let sides = std::env::args()
        .nth(1)
        .map(|arg| arg.parse::<i64>())
        .transpose()?
        .unwrap_or(6);

    let mut runtime = realm::standard_runtime::<Dice>(sides, RuntimeOptions::default())?;
    runtime.subscribe(|dice| {
        if let Some(face) = dice.face {
            println!("roll {:>2}: {face}", dice.rolls);
        }
    });
    runtime.start()?;
    for _ in 0..10 {
        runtime.dispatch(Msg::Roll)?;
    }
    runtime.stop()?;
    Ok(())
}
