//! Minimal interactive client for the matrix chat server.
//!
//! Run with: cargo run -p line-client-example -- --addr 127.0.0.1:7878
//!
//! Lines typed on stdin are sent as-is; every server line is printed.

use anyhow::{Context, Result};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpStream,
};
use tokio_util::codec::{Framed, LinesCodec};

#[derive(Parser)]
#[command(name = "line-client")]
#[command(about = "Line-based client for the matrix chat server")]
struct Cli {
    /// Server address
    #[arg(long, default_value = "127.0.0.1:7878")]
    addr: String,

    /// Display name to claim after connecting
    #[arg(long, short)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let stream = TcpStream::connect(&cli.addr)
        .await
        .with_context(|| format!("failed to connect to {}", cli.addr))?;
    let (mut sink, mut server) = Framed::new(stream, LinesCodec::new()).split::<String>();

    if let Some(name) = cli.name {
        sink.send(format!("NAME {name}")).await?;
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = server.next() => match line {
                Some(line) => println!("{}", line?),
                None => {
                    println!("connection closed by server");
                    break;
                }
            },
            input = stdin.next_line() => match input? {
                Some(input) => sink.send(input).await?,
                None => {
                    sink.send("QUIT".to_string()).await?;
                    break;
                }
            },
        }
    }

    Ok(())
}
