extern crate env_logger;
extern crate greeter_http;
extern crate http;

use std::io::Write;

use greeter_http::errors::*;
use greeter_http::Server;


const PORT: u16 = 3000;
const GREETING: &'static str = "Seja bem-vindo ao meu app Node.js no Vercel!";


fn init_logger() -> Result<()> {
    if ::std::env::var_os("LOG").is_none() {
        ::std::env::set_var("LOG", "info"); // default on
    }
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(buf, "[{}] - [{}] -> {}",
                record.level(),
                record.target(),
                record.args())
        })
        .parse(&::std::env::var("LOG").unwrap_or_default())
        .try_init()
        .chain_err(|| "failed to initialize logger")?;
    Ok(())
}


fn run() -> Result<()> {
    init_logger()?;
    let server = Server::bind(&format!("0.0.0.0:{}", PORT))?;
    println!("Servidor rodando na porta {}", PORT);
    server.start(|_request| {
        http::Response::builder()
            .status(200)
            .header("Content-Type", "text/plain")
            .body(GREETING.as_bytes().to_vec())
            .unwrap()
    })
}


pub fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        ::std::process::exit(1);
    }
}
