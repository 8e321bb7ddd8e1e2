use std::path::PathBuf;

use slidefeed::RunOptions;

const HELP: &str = "slidefeed - A live photo slideshow for the terminal.

Usage: slidefeed [OPTIONS]

  --config <path>      Read configuration from <path>
  --url <url>          Feed URL or path to a local JSON file
  --once               Fetch the feed once, print it and exit
  --version, -V        Show version and exit
  --help,    -h        Show this help message";

fn main() {
    let opts = match parse_args(std::env::args().skip(1)) {
        Ok(Some(opts)) => opts,
        Ok(None) => return,
        Err(message) => {
            eprintln!("error: {message}\n\n{HELP}");
            std::process::exit(2);
        }
    };

    if let Err(err) = slidefeed::run(opts) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

/// Returns `Ok(None)` when a flag was handled and the program should exit.
fn parse_args<I: Iterator<Item = String>>(mut args: I) -> Result<Option<RunOptions>, String> {
    let mut opts = RunOptions::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("slidefeed {}", slidefeed::VERSION);
                return Ok(None);
            }
            "--help" | "-h" => {
                println!("{HELP}");
                return Ok(None);
            }
            "--config" => {
                let path = args.next().ok_or("--config needs a path")?;
                opts.config_file = Some(PathBuf::from(path));
            }
            "--url" => {
                opts.url = Some(args.next().ok_or("--url needs a value")?);
            }
            "--once" => opts.once = true,
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    Ok(Some(opts))
}
