#![forbid(unsafe_code)]

use std::env;
use std::path::Path;
use std::process::ExitCode;

use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vgo_replay::check_file;

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let paths: Vec<String> = env::args().skip(1).collect();
    if paths.is_empty() {
        eprintln!("usage: vgo_replay <transcript.json>...");
        return ExitCode::from(2);
    }

    let mut diverged = false;
    for path in &paths {
        match check_file(Path::new(path)) {
            Ok(check) => {
                let verdict = if check.ok { "OK" } else { "MISMATCH" };
                println!(
                    "{verdict} {} recorded={} body={} replay={}",
                    check.window_id, check.recorded, check.body_digest, check.replay_digest
                );
                diverged |= !check.ok;
            }
            Err(err) => {
                error!(path = %path, %err, "replay failed");
                return ExitCode::from(2);
            }
        }
    }
    if diverged {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
