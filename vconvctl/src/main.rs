use clap::Parser;

fn main() {
    let cli = vconvctl::Cli::parse();
    vconvctl::init_tracing(&cli.log_level);
    if let Err(err) = vconvctl::run(cli) {
        eprintln!("erro: {err}");
        std::process::exit(1);
    }
}
