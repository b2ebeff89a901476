//! Control-channel client used by the CLI subcommands.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::command::Command;
use crate::error::{Error, Result};

const READ_LIMIT: usize = 2048;

/// Send one command to the daemon and return its text response.
pub async fn send(host: &str, port: u16, command: &Command) -> Result<String> {
    let mut conn = TcpStream::connect((host, port)).await?;
    let data =
        serde_json::to_vec(command).map_err(|e| Error::SerializeError(e.to_string()))?;
    conn.write_all(&data).await?;

    let mut buf = vec![0u8; READ_LIMIT];
    let len = conn.read(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}

/// Execute a command and print the response. An `Error:`-prefixed response
/// is a fabric-reported failure and becomes this process's exit status.
pub async fn run(host: &str, port: u16, command: Command) -> Result<()> {
    let response = send(host, port, &command).await?;
    if let Some(message) = response.strip_prefix("Error: ") {
        return Err(Error::Remote(message.to_string()));
    }
    if !response.is_empty() && response != "nil" {
        println!("{response}");
    }
    Ok(())
}
