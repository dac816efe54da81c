//! TCP echo reflector used as the far end of a timing exchange.
//!
//! Every accepted connection gets its own task that writes back whatever it
//! reads until the peer closes its side.

use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinSet,
};

use crate::stats::ReflectorStats;

/// Read buffer size of a single echo task.
const ECHO_BUFFER_LEN: usize = 4096;

/// Counters shared between the accept loop and the echo tasks.
#[derive(Debug)]
pub struct ReflectorCounters {
    pub connections_accepted: AtomicU64,
    pub connections_failed: AtomicU64,
    pub bytes_echoed: AtomicU64,
}

impl ReflectorCounters {
    pub fn new() -> Self {
        ReflectorCounters {
            connections_accepted: AtomicU64::new(0),
            connections_failed: AtomicU64::new(0),
            bytes_echoed: AtomicU64::new(0),
        }
    }

    /// Builds the shutdown summary.
    pub fn to_stats(&self, start_time: Instant) -> ReflectorStats {
        ReflectorStats {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            bytes_echoed: self.bytes_echoed.load(Ordering::Relaxed),
            uptime_seconds: start_time.elapsed().as_secs_f64(),
        }
    }
}

impl Default for ReflectorCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves echo connections on `listener` until `shutdown` resolves.
///
/// With `max_connections` set, stops accepting after that many connections
/// and returns once all of them have been served.
pub async fn serve<F>(
    listener: TcpListener,
    max_connections: Option<u64>,
    shutdown: F,
) -> ReflectorStats
where
    F: Future<Output = ()>,
{
    let counters = Arc::new(ReflectorCounters::new());
    let start_time = Instant::now();
    let mut tasks = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        if max_connections
            .is_some_and(|max| counters.connections_accepted.load(Ordering::Relaxed) >= max)
        {
            log::debug!("connection limit reached, draining");
            while tasks.join_next().await.is_some() {}
            break;
        }

        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        counters.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        let counters = Arc::clone(&counters);
                        tasks.spawn(async move {
                            echo_connection(stream, peer, &counters).await;
                        });
                    }
                    Err(e) => {
                        log::warn!("Failed to accept connection: {}", e);
                    }
                }
            }

            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}

            _ = &mut shutdown => {
                log::info!("shutting down echo reflector");
                tasks.abort_all();
                break;
            }
        }
    }

    counters.to_stats(start_time)
}

async fn echo_connection(mut stream: TcpStream, peer: SocketAddr, counters: &ReflectorCounters) {
    log::debug!("accepted connection from {}", peer);
    let mut buf = [0u8; ECHO_BUFFER_LEN];
    let mut total = 0u64;

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::warn!("Read from {} failed: {}", peer, e);
                counters.connections_failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if let Err(e) = stream.write_all(&buf[..n]).await {
            log::warn!("Echo to {} failed: {}", peer, e);
            counters.connections_failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        total += n as u64;
        counters.bytes_echoed.fetch_add(n as u64, Ordering::Relaxed);
    }

    log::debug!("connection from {} closed after {} bytes", peer, total);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_echoes_until_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, Some(1), std::future::pending()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        client.write_all(b" world").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b" world");
        drop(client);

        let stats = timeout(Duration::from_secs(5), server)
            .await
            .expect("reflector did not finish")
            .unwrap();
        assert_eq!(stats.connections_accepted, 1);
        assert_eq!(stats.connections_failed, 0);
        assert_eq!(stats.bytes_echoed, 11);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stats = timeout(
            Duration::from_secs(5),
            serve(listener, None, async {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }),
        )
        .await
        .expect("shutdown was not honoured");
        assert_eq!(stats.connections_accepted, 0);
        assert_eq!(stats.bytes_echoed, 0);
    }
}
