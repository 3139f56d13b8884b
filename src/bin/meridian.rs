use std::env;
use std::fs;
use std::process;
use std::thread;
use std::time::Duration;

use getopts::Options;

use meridian::config;
use meridian::module;

fn print_usage(program: &str, opts: Options) {
    let brief = format!(
        "Usage: {} [run|list-modules] [options]\n\n\
         Commands:\n    run             Start the DNS server (default)\n    \
         list-modules    List all registered modules",
        program
    );
    print!("{}", opts.usage(&brief));
}

/// Main entry point for the Meridian DNS server
fn main() {
    module::register_builtin_modules();

    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    // the first non-flag argument selects the command; `run` is the default
    let (command, rest) = match args.get(1).map(String::as_str) {
        Some("list-modules") => ("list-modules", &args[2..]),
        Some("run") => ("run", &args[2..]),
        _ => ("run", &args[1..]),
    };

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optopt("c", "config", "Load configuration from FILE", "FILE");

    let opt_matches = match opts.parse(rest) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("Error: {}", f);
            process::exit(1);
        }
    };

    if opt_matches.opt_present("h") {
        print_usage(&program, opts);
        return;
    }

    match command {
        "list-modules" => {
            println!("Registered modules:");
            for id in module::module_ids() {
                println!("  {}", id);
            }
        }
        _ => run_server(opt_matches.opt_str("c")),
    }
}

fn run_server(config_file: Option<String>) {
    let config_data = match config_file {
        Some(path) => match fs::read(&path) {
            Ok(data) => data,
            Err(err) => {
                eprintln!("Error: reading config file {}: {}", path, err);
                process::exit(1);
            }
        },
        // no file provided: config::load falls back to the default
        // configuration
        None => Vec::new(),
    };

    if let Err(err) = config::load(&config_data) {
        eprintln!("Error: {}", err);
        process::exit(1);
    }

    // listeners run on their own threads; keep the process alive
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
