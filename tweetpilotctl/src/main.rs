use clap::Parser;

fn main() {
    let cli = tweetpilotctl::Cli::parse();
    if let Err(err) = tweetpilotctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
