use std::io;

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, ToSocketAddrs},
};

use crate::error::{Result, WorkerErr};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Parameter Server client wrapper.
///
/// Contract (current protocol):
/// - requests are written in order on a single stream
/// - the server answers the requests that expect a reply in that same order
/// - fire and forget requests are never answered, their failures show up as a
///   `Command::Deferred` reply to the next request that expects one
pub struct PsClient {
    rx: OnoReceiver<BoxedReader>,
    tx: OnoSender<BoxedWriter>,
    buf: Vec<u32>,
}

impl PsClient {
    /// Creates a new `PsClient` over the two halves of a stream.
    pub fn new<R, W>(rx: R, tx: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (rx, tx) = comms::channel(Box::new(rx) as BoxedReader, Box::new(tx) as BoxedWriter);

        Self {
            rx,
            tx,
            buf: Vec::new(),
        }
    }

    /// Opens a tcp connection to the server listening on `addr`.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (rx, tx) = stream.into_split();
        Ok(Self::new(rx, tx))
    }

    /// Wraps any bidirectional stream, used for in memory transports.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (rx, tx) = tokio::io::split(stream);
        Self::new(rx, tx)
    }

    /// Sends a request that is never answered.
    pub async fn send(&mut self, msg: &Msg<'_>) -> Result<()> {
        self.tx.send(msg).await.map_err(closed)
    }

    /// Sends a request and hands its reply to `on_reply`.
    ///
    /// An `Err` reply or a deferred failure is turned into `WorkerErr::Remote` without
    /// calling `on_reply`.
    pub async fn request<T, F>(&mut self, msg: &Msg<'_>, on_reply: F) -> Result<T>
    where
        F: for<'b> FnOnce(Msg<'b>) -> Result<T>,
    {
        self.request_or(msg, WorkerErr::Remote, on_reply).await
    }

    /// Like `request`, with `rejected` building the error for an `Err` reply to `msg`
    /// itself. A failure of an earlier request is always `WorkerErr::Remote`.
    async fn request_or<T, F>(
        &mut self,
        msg: &Msg<'_>,
        rejected: fn(String) -> WorkerErr,
        on_reply: F,
    ) -> Result<T>
    where
        F: for<'b> FnOnce(Msg<'b>) -> Result<T>,
    {
        self.tx.send(msg).await.map_err(closed)?;

        let reply: Msg = self.rx.recv_into(&mut self.buf).await.map_err(closed)?;
        match reply {
            Msg::Control(Command::Deferred { request, error }) => Err(WorkerErr::Remote(format!(
                "an earlier request failed, {request}: {error}"
            ))),
            Msg::Err(e) => Err(rejected(e.into_owned())),
            reply => on_reply(reply),
        }
    }

    /// Sends a request answered with a control message and returns its command.
    pub async fn call(&mut self, msg: &Msg<'_>) -> Result<Command> {
        let name = request_name(msg);

        self.request(msg, |reply| match reply {
            Msg::Control(reply) => Ok(reply),
            other => Err(unexpected(name, &other)),
        })
        .await
    }

    /// Sends a registration answered with a control message.
    ///
    /// # Errors
    /// `WorkerErr::Registration` if the server rejects this request, `WorkerErr::Remote`
    /// if an earlier request failed and this one was not executed.
    pub async fn register(&mut self, msg: &Msg<'_>) -> Result<Command> {
        let name = request_name(msg);

        self.request_or(msg, WorkerErr::Registration, |reply| match reply {
            Msg::Control(reply) => Ok(reply),
            other => Err(unexpected(name, &other)),
        })
        .await
    }

    /// Shorthand for `call` with a request that carries no numbers.
    pub async fn control(&mut self, cmd: Command) -> Result<Command> {
        self.call(&Msg::Control(cmd)).await
    }

    /// Sends a request answered with `runs` runs of numbers and returns them in order.
    ///
    /// # Errors
    /// `WorkerErr::Protocol` if the reply holds a different amount of runs, or its run
    /// lengths don't add up to the amount of numbers received.
    pub async fn values(&mut self, msg: &Msg<'_>, runs: usize) -> Result<Vec<Vec<f32>>> {
        let name = request_name(msg);

        self.request(msg, |reply| match reply {
            Msg::Data {
                cmd: Command::Values { lens },
                nums,
            } => split_runs(name, runs, &lens, nums),
            other => Err(unexpected(name, &other)),
        })
        .await
    }

    /// Says goodbye to the server and closes the writing half.
    pub async fn disconnect(mut self) -> Result<()> {
        match self.control(Command::Disconnect).await? {
            Command::Disconnect => {}
            other => {
                return Err(WorkerErr::Protocol(format!(
                    "unexpected reply to disconnect: {}",
                    other.name()
                )));
            }
        }

        self.tx.shutdown().await?;
        Ok(())
    }
}

fn closed(e: io::Error) -> WorkerErr {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => {
            WorkerErr::Connection(format!("connection to the server lost: {e}"))
        }
        _ => WorkerErr::Io(e),
    }
}

fn request_name(msg: &Msg<'_>) -> &'static str {
    match msg {
        Msg::Control(cmd) | Msg::Data { cmd, .. } => cmd.name(),
        Msg::Err(_) => "error",
    }
}

fn unexpected(name: &str, reply: &Msg<'_>) -> WorkerErr {
    WorkerErr::Protocol(format!(
        "unexpected reply to {name}: {}",
        request_name(reply)
    ))
}

fn split_runs(name: &str, runs: usize, lens: &[usize], nums: &[f32]) -> Result<Vec<Vec<f32>>> {
    if lens.len() != runs {
        return Err(WorkerErr::Protocol(format!(
            "{name} asked for {runs} tables but {} were returned",
            lens.len()
        )));
    }

    let total = lens
        .iter()
        .try_fold(0usize, |acc, &len| acc.checked_add(len))
        .ok_or_else(|| {
            WorkerErr::Protocol(format!("{name} announced more values than can be addressed"))
        })?;

    if total != nums.len() {
        return Err(WorkerErr::Protocol(format!(
            "{name} announced {total} values but {} were received",
            nums.len()
        )));
    }

    let mut rest = nums;
    let out = lens
        .iter()
        .map(|&len| {
            let (run, tail) = rest.split_at(len);
            rest = tail;
            run.to_vec()
        })
        .collect();

    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use comms::specs::{ModelId, TableId};
    use tokio::io;

    use super::*;

    const BUF_SIZE: usize = 4096;

    fn pull(table_ids: Vec<TableId>) -> Msg<'static> {
        Msg::Control(Command::PullDense {
            model_id: ModelId(0),
            table_ids,
        })
    }

    /// Answers the first request received on `stream` with `reply`.
    async fn answer_once(stream: io::DuplexStream, reply: Msg<'_>) {
        let (rx, tx) = io::split(stream);
        let (mut rx, mut tx) = comms::channel(rx, tx);
        let mut buf: Vec<u32> = Vec::new();

        let _: Msg = rx.recv_into(&mut buf).await.unwrap();
        tx.send(&reply).await.unwrap();
    }

    #[tokio::test]
    async fn values_are_split_in_request_order() {
        let (sv_stream, wk_stream) = io::duplex(BUF_SIZE);
        let mut client = PsClient::from_stream(wk_stream);

        let nums = [1.0, 2.0, 3.0, 4.0, 5.0];
        let server = answer_once(
            sv_stream,
            Msg::Data {
                cmd: Command::Values { lens: vec![2, 0, 3] },
                nums: &nums,
            },
        );

        let msg = pull(vec![TableId(0), TableId(1), TableId(2)]);
        let (values, ()) = tokio::join!(client.values(&msg, 3), server);

        assert_eq!(
            values.unwrap(),
            vec![vec![1.0, 2.0], vec![], vec![3.0, 4.0, 5.0]]
        );
    }

    #[tokio::test]
    async fn wrong_amount_of_runs_is_a_protocol_error() {
        let (sv_stream, wk_stream) = io::duplex(BUF_SIZE);
        let mut client = PsClient::from_stream(wk_stream);

        let nums = [1.0, 2.0];
        let server = answer_once(
            sv_stream,
            Msg::Data {
                cmd: Command::Values { lens: vec![2] },
                nums: &nums,
            },
        );

        let msg = pull(vec![TableId(0), TableId(1)]);
        let (values, ()) = tokio::join!(client.values(&msg, 2), server);

        assert!(matches!(values, Err(WorkerErr::Protocol(_))));
    }

    #[tokio::test]
    async fn short_payload_is_a_protocol_error() {
        let (sv_stream, wk_stream) = io::duplex(BUF_SIZE);
        let mut client = PsClient::from_stream(wk_stream);

        let nums = [1.0];
        let server = answer_once(
            sv_stream,
            Msg::Data {
                cmd: Command::Values { lens: vec![2] },
                nums: &nums,
            },
        );

        let msg = pull(vec![TableId(0)]);
        let (values, ()) = tokio::join!(client.values(&msg, 1), server);

        assert!(matches!(values, Err(WorkerErr::Protocol(_))));
    }

    #[tokio::test]
    async fn error_reply_is_remote() {
        let (sv_stream, wk_stream) = io::duplex(BUF_SIZE);
        let mut client = PsClient::from_stream(wk_stream);

        let server = answer_once(sv_stream, Msg::Err(Cow::Borrowed("unknown model model#0")));

        let msg = pull(vec![TableId(0)]);
        let (values, ()) = tokio::join!(client.values(&msg, 1), server);

        match values {
            Err(WorkerErr::Remote(e)) => assert_eq!(e, "unknown model model#0"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn overflowing_run_lengths_are_a_protocol_error() {
        let (sv_stream, wk_stream) = io::duplex(BUF_SIZE);
        let mut client = PsClient::from_stream(wk_stream);

        let nums = [1.0];
        let server = answer_once(
            sv_stream,
            Msg::Data {
                cmd: Command::Values {
                    lens: vec![usize::MAX, 2],
                },
                nums: &nums,
            },
        );

        let msg = pull(vec![TableId(0), TableId(1)]);
        let (values, ()) = tokio::join!(client.values(&msg, 2), server);

        assert!(matches!(values, Err(WorkerErr::Protocol(_))));
    }

    fn register_model() -> Msg<'static> {
        Msg::Control(Command::RegisterModel {
            name: "m".into(),
            optimizer: comms::specs::OptimizerSpec::sgd(),
        })
    }

    #[tokio::test]
    async fn rejected_registration_is_a_registration_error() {
        let (sv_stream, wk_stream) = io::duplex(BUF_SIZE);
        let mut client = PsClient::from_stream(wk_stream);

        let server = answer_once(sv_stream, Msg::Err(Cow::Borrowed("unknown optimizer lbfgs")));
        let msg = register_model();
        let (reply, ()) = tokio::join!(client.register(&msg), server);

        assert!(matches!(reply, Err(WorkerErr::Registration(_))));
    }

    #[tokio::test]
    async fn earlier_failure_is_remote_even_for_registrations() {
        let (sv_stream, wk_stream) = io::duplex(BUF_SIZE);
        let mut client = PsClient::from_stream(wk_stream);

        let server = answer_once(
            sv_stream,
            Msg::Control(Command::Deferred {
                request: "push_dense".into(),
                error: "unknown table#9".into(),
            }),
        );
        let msg = register_model();
        let (reply, ()) = tokio::join!(client.register(&msg), server);

        match reply {
            Err(WorkerErr::Remote(e)) => assert!(e.contains("push_dense"), "{e}"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn hang_up_is_a_connection_error() {
        let (sv_stream, wk_stream) = io::duplex(BUF_SIZE);
        let mut client = PsClient::from_stream(wk_stream);
        drop(sv_stream);

        let result = client.control(Command::Save { model_id: ModelId(0) }).await;
        assert!(matches!(result, Err(WorkerErr::Connection(_))));
    }
}
