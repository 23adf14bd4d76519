use eazy::{Environment, Value, run};
use std::process::ExitCode;

fn main() -> ExitCode {
    let Some(path) = std::env::args().nth(1) else {
        eprintln!("Usage: eazy FILE");
        return ExitCode::FAILURE;
    };

    let source = match std::fs::read_to_string(&path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Cannot read '{}': {}", path, e);
            return ExitCode::FAILURE;
        }
    };

    match run(&source, Environment::new_global_populated()) {
        Ok(Value::Nothing) => ExitCode::SUCCESS,
        Ok(value) => {
            println!("{}", value);
            ExitCode::SUCCESS
        }
        Err(e) => {
            e.pretty_print(&source);
            ExitCode::FAILURE
        }
    }
}
