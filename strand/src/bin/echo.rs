//! Echoes every line back to the client until it disconnects or goes quiet.

use strand::{Connection, FiberCx, HandlerError, HandlerResult};

#[strand::main]
async fn main(mut conn: Connection, cx: FiberCx) -> HandlerResult {
    let peer = conn.peer_addr();
    cx.line(format_args!("connection from {peer}"));

    let mut buf = [0u8; 4096];
    let mut total = 0;
    loop {
        let n = match conn.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(HandlerError::Cancelled(reason)) => {
                cx.line(format_args!("{peer}: {reason}"));
                break;
            }
            Err(err) => return Err(err),
        };
        conn.write_all(&buf[..n]).await?;
        total += n;
    }

    cx.line(format_args!("{peer} closed after {total} bytes"));
    Ok(())
}
