//! Minimal runnable server: accepts on a blocking listener and hands every
//! connection to the reactor, which answers each request with a fixed body.
//!
//! Run with `cargo run --example echo`, then `curl http://127.0.0.1:8080/`.

use std::io::ErrorKind;
use std::net::TcpListener;

use mio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ember::config::Config;
use ember::pool::Reactor;
use ember::request::{Flow, Job, Processor, Request, Yield};

const BODY: &str = "Hello from ember\n";

struct Hello;

impl Processor<TcpStream> for Hello {
    fn begin(&self) -> Box<dyn Job<TcpStream>> {
        Box::new(HelloJob { written: None })
    }
}

struct HelloJob {
    /// `None` until a full request has been read; then the number of
    /// response bytes already flushed.
    written: Option<usize>,
}

impl Job<TcpStream> for HelloJob {
    fn poll(&mut self, req: &mut Request<'_, TcpStream>) -> Flow {
        loop {
            match self.written {
                None => {
                    let terminated = req
                        .read_buf()
                        .windows(4)
                        .any(|window| window == b"\r\n\r\n");
                    if terminated {
                        let _ = req.stream().set_nodelay(true);
                        let head = format!(
                            "HTTP/1.1 200 OK\r\nDate: {}\r\nContent-Length: {}\r\n\r\n",
                            req.date(),
                            BODY.len()
                        );
                        req.response().extend_from_slice(head.as_bytes());
                        req.response().extend_from_slice(BODY.as_bytes());
                        self.written = Some(0);
                    } else {
                        match req.fill() {
                            Ok(0) => return Flow::Yield(Yield::Abort),
                            Ok(_) => {}
                            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                                req.set_must_read(true);
                                return Flow::Yield(Yield::WantRead);
                            }
                            Err(_) => return Flow::Yield(Yield::Abort),
                        }
                    }
                }
                Some(written) => {
                    let total = req.response().len();
                    match req.flush_response(written) {
                        Ok(n) if written + n >= total => {
                            req.read_buf_mut().clear();
                            req.set_must_read(true);
                            return Flow::Done(None);
                        }
                        Ok(n) => {
                            self.written = Some(written + n);
                            return Flow::Yield(Yield::WantWrite);
                        }
                        Err(err) if err.kind() == ErrorKind::WouldBlock => {
                            return Flow::Yield(Yield::WantWrite);
                        }
                        Err(_) => return Flow::Yield(Yield::Abort),
                    }
                }
            }
        }
    }
}

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let listener = TcpListener::bind("127.0.0.1:8080")?;
    let reactor: Reactor = Reactor::new(Config::default(), Hello)?;
    info!("listening on {}", listener.local_addr()?);

    for stream in listener.incoming() {
        let stream = stream?;
        stream.set_nonblocking(true)?;
        if !reactor.assign(TcpStream::from_std(stream)) {
            warn!("all workers are saturated; connection dropped");
        }
    }

    reactor.shutdown();
    Ok(())
}
