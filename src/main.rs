mod commands;
mod logging;

use std::process::ExitCode;

fn usage() {
    println!("versfs - tool for managing versfs volumes");
    println!("usage: versfs <command> [<args>]\n");
    println!("Commands:");
    println!("  format      {:<40}", "Format a new volume");
    println!("  inspect     {:<40}", "Print a volume's superblock");
    println!("  selftest    {:<40}", "Round-trip a scratch volume and verify persistence");
    println!("  version     Display version\n");
    println!("Pass -v (repeatable) before the command for more verbose logging.");
}

fn main() -> ExitCode {
    let mut args: Vec<String> = std::env::args().collect();

    let mut verbosity = 0u8;
    while args.len() > 1 && (args[1] == "-v" || args[1] == "--verbose") {
        verbosity += 1;
        args.remove(1);
    }
    logging::init(verbosity);

    if args.len() < 2 {
        println!("missing command");
        usage();
        return ExitCode::from(1);
    }

    let cmd = args[1].as_str();
    let argv = args[1..].to_vec();

    let result = match cmd {
        "--help" | "-h" | "help" => {
            usage();
            Ok(())
        }
        "version" => {
            println!("versfs {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "format" => commands::cmd_format(argv),
        "inspect" => commands::cmd_inspect(argv),
        "selftest" => commands::cmd_selftest(argv),
        other => {
            println!("unknown command: {other}");
            usage();
            return ExitCode::from(1);
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}
