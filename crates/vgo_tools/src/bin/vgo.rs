#![forbid(unsafe_code)]

use std::env;
use std::io::{self, IsTerminal, Read};

use vgo_tools::attest_cli::{execute_attest_command, generate_keypair};
use vgo_tools::export_cli::execute_verify_manifest;

const USAGE: &str = "usage: vgo <keygen|pubkey|sign-proof|verify-manifest> [args]";

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let command = args.first().ok_or_else(|| USAGE.to_string())?.as_str();

    let output = match command {
        "keygen" => {
            let (secret, public) = generate_keypair();
            format!("signing_key={secret}\nverifying_key={public}")
        }
        "pubkey" | "sign-proof" => {
            let secret = read_signing_key()?;
            execute_attest_command(command, &args[1..], &secret)?
        }
        "verify-manifest" => execute_verify_manifest(args.get(1).map(String::as_str))?,
        _ => return Err(USAGE.to_string()),
    };
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

fn read_signing_key() -> Result<String, String> {
    let value = if io::stdin().is_terminal() {
        rpassword::prompt_password("Enter signing key (hex):").map_err(|e| e.to_string())?
    } else {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .map_err(|e| e.to_string())?;
        input
    };
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        return Err("signing key must not be empty".to_string());
    }
    Ok(trimmed)
}
