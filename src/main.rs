use clap::Parser;
use lazy_pages::config::Cli;
use lazy_pages::server;

fn main() {
    let cli = Cli::parse();

    match server::cr_lazy_pages(&cli) {
        Ok(code) => {
            if code > 0 {
                eprintln!(
                    "[lazy-pages] {} task(s) finished with undelivered pages",
                    code
                );
            }
            std::process::exit(code);
        }
        Err(e) => {
            eprintln!("[lazy-pages] Error: {:#}", e);
            std::process::exit(-1);
        }
    }
}
