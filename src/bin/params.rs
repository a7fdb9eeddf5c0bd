use anoncast::amd::AmdParams;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    about = "Tabulate codec parameters across security levels",
    author,
    version
)]
struct Cli {
    /// Application message length in bits
    #[arg(long = "message-len", default_value_t = 64)]
    message_len: usize,

    /// Largest security parameter to tabulate
    #[arg(long = "max-security", default_value_t = 15)]
    max_security: u32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    println!("message length: {} bits", cli.message_len);
    println!(
        "{:>8}  {:>4}  {:>6}  {:>9}  {:>9}",
        "security", "d", "gamma", "codeword", "overhead"
    );
    for security in 1..=cli.max_security {
        let params = AmdParams::derive(cli.message_len, security)?;
        let codeword = params.codeword_len();
        let overhead = codeword as f64 / cli.message_len as f64;
        println!(
            "{:>8}  {:>4}  {:>6}  {:>9}  {:>8.2}x",
            security, params.d, params.gamma, codeword, overhead
        );
    }
    Ok(())
}
