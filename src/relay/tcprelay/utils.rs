//! Utilities for TCP relay
//!
//! The `CopyBuffer` and `Copy` are borrowed from the [tokio](https://github.com/tokio-rs/tokio) project,
//! extended with a per-read deadline and a teardown flag consulted between
//! blocks. LICENSE MIT

use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::ready;
use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{self, Instant, Sleep},
};

use crate::relay::Teardown;

/// Read buffer size for relaying, in bytes
const COPY_BUFFER_SIZE: usize = 1 << 14;

/// Behavior of one relay direction
#[derive(Clone)]
pub struct CopyOptions {
    /// Deadline for every single read; `None` waits forever
    pub read_timeout: Option<Duration>,
    /// Listener teardown flag; once set the copy stops before the next block
    pub teardown: Teardown,
}

struct CopyBuffer {
    read_done: bool,
    pos: usize,
    cap: usize,
    amt: u64,
    buf: Box<[u8]>,
}

impl CopyBuffer {
    fn new() -> CopyBuffer {
        CopyBuffer {
            read_done: false,
            pos: 0,
            cap: 0,
            amt: 0,
            buf: vec![0; COPY_BUFFER_SIZE].into_boxed_slice(),
        }
    }

    fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
        teardown: &Teardown,
        read_timeout: Option<Duration>,
        delay: &mut Option<Pin<Box<Sleep>>>,
    ) -> Poll<io::Result<u64>>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            // The port is being torn down. Stop before the next block.
            if teardown.is_set() {
                ready!(writer.as_mut().poll_flush(cx))?;
                return Poll::Ready(Ok(self.amt));
            }

            // If our buffer is empty, then we need to read some data to
            // continue.
            if self.pos == self.cap && !self.read_done {
                let read_result = {
                    let me = &mut *self;
                    let mut buf = ReadBuf::new(&mut me.buf);
                    match reader.as_mut().poll_read(cx, &mut buf) {
                        Poll::Ready(Ok(())) => Some(buf.filled().len()),
                        Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                        Poll::Pending => None,
                    }
                };

                match read_result {
                    Some(0) => self.read_done = true,
                    Some(n) => {
                        self.pos = 0;
                        self.cap = n;
                        if let (Some(timeout), Some(delay)) = (read_timeout, delay.as_mut()) {
                            delay.as_mut().reset(Instant::now() + timeout);
                        }
                    }
                    None => {
                        if let Some(delay) = delay.as_mut() {
                            ready!(delay.as_mut().poll(cx));
                            return Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")));
                        }
                        return Poll::Pending;
                    }
                }
            }

            // If our buffer has some data, let's write it out!
            while self.pos < self.cap {
                let me = &mut *self;
                let i = ready!(writer.as_mut().poll_write(cx, &me.buf[me.pos..me.cap]))?;
                if i == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write zero byte into writer",
                    )));
                } else {
                    self.pos += i;
                    self.amt += i as u64;
                }
            }

            // If we've written all the data and we've seen EOF, flush out the
            // data and finish the transfer.
            if self.pos == self.cap && self.read_done {
                ready!(writer.as_mut().poll_flush(cx))?;
                return Poll::Ready(Ok(self.amt));
            }
        }
    }
}

/// A future that asynchronously copies the entire contents of a reader into a
/// writer, honoring [`CopyOptions`].
#[pin_project]
#[must_use = "futures do nothing unless you `.await` or poll them"]
struct Copy<'a, R: ?Sized, W: ?Sized> {
    #[pin]
    reader: &'a mut R,
    #[pin]
    writer: &'a mut W,
    buf: CopyBuffer,
    teardown: Teardown,
    read_timeout: Option<Duration>,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<R, W> Future for Copy<'_, R, W>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    type Output = io::Result<u64>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.project();
        this.buf
            .poll_copy(cx, this.reader, this.writer, this.teardown, *this.read_timeout, this.delay)
    }
}

fn copy<'a, R, W>(reader: &'a mut R, writer: &'a mut W, opts: CopyOptions) -> Copy<'a, R, W>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    Copy {
        reader,
        writer,
        buf: CopyBuffer::new(),
        delay: opts.read_timeout.map(|t| Box::pin(time::sleep(t))),
        teardown: opts.teardown,
        read_timeout: opts.read_timeout,
    }
}

/// Copy data from the encrypted reader (client) to the plain writer (upstream)
pub async fn copy_from_encrypted<ER, PW>(reader: &mut ER, writer: &mut PW, opts: CopyOptions) -> io::Result<u64>
where
    ER: AsyncRead + Unpin + ?Sized,
    PW: AsyncWrite + Unpin + ?Sized,
{
    copy(reader, writer, opts).await
}

/// Copy data from the plain reader (upstream) to the encrypted writer (client)
pub async fn copy_to_encrypted<PR, EW>(reader: &mut PR, writer: &mut EW, opts: CopyOptions) -> io::Result<u64>
where
    PR: AsyncRead + Unpin + ?Sized,
    EW: AsyncWrite + Unpin + ?Sized,
{
    copy(reader, writer, opts).await
}
