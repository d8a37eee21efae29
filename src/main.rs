mod audio;
mod call;
mod cli;
mod config;
mod error;
mod outcome;
mod providers;
mod proxy;
mod ratelimit;
mod realtime;
mod runtime;
mod server;
mod stream;
mod tts;

use config::Config;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const CLI_VERBS: &[&str] = &["call", "continue", "speak", "end", "status", "tail", "expose"];

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("--version") => println!("voice-bridge {VERSION}"),
        Some("--help") | Some("-h") => print_usage(),
        Some(verb) if CLI_VERBS.contains(&verb) => {
            init_tracing(true);
            let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
            let code = rt.block_on(cli::run(verb, &args[2..]));
            std::process::exit(code);
        }
        Some(other) => {
            eprintln!("Unknown option: {other}");
            print_usage();
            std::process::exit(1);
        }
        None => {
            init_tracing(false);
            let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
            rt.block_on(server());
        }
    }
}

fn init_tracing(to_stderr: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "voice_bridge=info,tower_http=info".into());

    // CLI verbs print JSON to stdout; logs must stay out of the way.
    if to_stderr {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn print_usage() {
    println!("voice-bridge {VERSION}");
    println!("Telephony voice-call bridge between carriers and a realtime speech model");
    println!();
    println!("Usage: voice-bridge [COMMAND]");
    println!();
    println!("Commands:");
    println!("  call <to> <prompt...>       Start an outbound call");
    println!("      [--mode conversation] [--session-key KEY]");
    println!("  continue <callId> <msg...>  Speak and wait for the next user turn");
    println!("  speak <callId> <text...>    Speak into an active call");
    println!("  end <callId>                Hang up");
    println!("  status                      Active calls and recent history");
    println!("  tail [N]                    Last N records from the call log");
    println!("  expose                      Print the resolved public URL");
    println!();
    println!("Options:");
    println!("  --version   Print version");
    println!("  --help, -h  Print this help message");
    println!();
    println!("Without a command, starts the voice server.");
}

async fn server() {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime::run(config).await {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
}
