use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::mpsc,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{info, warn};

use crate::{
    cli::ConnectArgs,
    codec::ClientCodec,
    console::stdin_lines,
    message::{ClientFrame, FrameKind, ServerFrame},
};

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";
const BELL: &str = "\x07";

pub async fn run(args: ConnectArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, ClientCodec::new());
    let mut sink = FramedWrite::new(writer, ClientCodec::new());

    let handshake = if args.register {
        ClientFrame::register(&args.username, &args.password)
    } else {
        ClientFrame::login(&args.username, &args.password)
    };
    sink.send(handshake).await?;

    let mut input = stdin_lines();
    run_client_loop(&mut frames, &mut sink, &mut input).await?;

    if let Err(error) = sink.get_mut().shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
    Ok(())
}

async fn run_client_loop(
    frames: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, ClientCodec>,
    sink: &mut FramedWrite<tokio::net::tcp::OwnedWriteHalf, ClientCodec>,
    input: &mut mpsc::Receiver<String>,
) -> Result<()> {
    loop {
        select! {
            frame = frames.next() => match frame {
                Some(Ok(Ok(frame))) => write_stdout(&render(&frame)).await?,
                Some(Ok(Err(err))) => warn!(error = %err, "ignoring malformed frame from server"),
                Some(Err(err)) => return Err(err.into()),
                None => {
                    write_stdout("*** server closed the connection").await?;
                    return Ok(());
                }
            },
            line = input.recv() => match line {
                Some(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    // The server answers /exit by closing, which ends the loop.
                    sink.send(ClientFrame::from_input(&line)).await?;
                }
                None => return Ok(()),
            },
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                return Ok(());
            }
        }
    }
}

/// Terminal rendering of one server frame.
pub fn render(frame: &ServerFrame) -> String {
    let from = frame.username.as_deref().unwrap_or("?");
    match frame.kind {
        FrameKind::Server => format!("*** {}", frame.body),
        FrameKind::Command | FrameKind::Action => frame.body.clone(),
        FrameKind::Message => format!("<{from}> {}", frame.body),
        FrameKind::Private => format!("{BELL}[PM from {from}] {}", frame.body),
        FrameKind::PrivateSent => format!("[PM to {from}] {}", frame.body),
        FrameKind::Clear => CLEAR_SCREEN.to_string(),
    }
}

async fn write_stdout(text: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(text.as_bytes()).await?;
    if !text.starts_with(CLEAR_SCREEN) {
        stdout.write_all(b"\n").await?;
    }
    stdout.flush().await
}
