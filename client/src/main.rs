use std::env;

use tokio::select;
use tokio::signal;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_stream::StreamExt; // provides combinator methods like next on to of FramedRead buf read and Stream trait

use tracing_subscriber::fmt;
use tracing::{info, warn, Level};

use client::{ClientError, Notice};
use protocol::SERVER_ADDR;

const LINES_MAX_LEN: usize = 4096;

const FMT_GREEN: &str = "\x1b[32m";
const FMT_RED: &str = "\x1b[31m";
const FMT_END: &str = "\x1b[0m";

fn print_notice(notice: Notice) {
    match notice {
        Notice::Message(line) => println!("{}", line),
        Notice::Online(line) => println!("{}{}{}", FMT_GREEN, line, FMT_END),
        Notice::Offline(line) => println!("{}{}{}", FMT_RED, line, FMT_END),
    }
}

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    fmt()
        .compact()
        .with_max_level(Level::WARN)
        .init();

    let name = env::args().nth(1).ok_or(ClientError::BadParam("usage: client <user name>"))?;

    let (mut reader, mut writer) = client::connect(SERVER_ADDR).await?;
    writer.register(&name).await?;
    writer.send_online().await?;

    println!("Hi [{}], welcome to tiny chat room.", name.trim());

    let mut receiving = tokio::spawn(async move {
        reader.receive_loop(print_notice).await
    });

    let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new_with_max_length(LINES_MAX_LEN));
    let mut server_alive = true;

    loop {
        select! {
            line = lines.next() => match line {
                Some(Ok(line)) if line.is_empty() => continue,
                Some(Ok(line)) => writer.send_plain(&line).await?,
                Some(Err(e)) => warn!("input line skipped: {}", e),
                None => break, // stdin closed
            },
            res = &mut receiving => {
                if let Ok(Err(e)) = res {
                    warn!("receive failed: {}", e);
                }
                server_alive = false;
                break
            }
            _ = signal::ctrl_c() => {
                info!("Session terminated by user...");
                break
            }
        }
    }

    if server_alive {
        writer.send_offline().await?;
        writer.close().await?;
        receiving.abort();
    }

    Ok(())
}
