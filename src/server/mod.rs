//! Server: accept loop, command dispatch, reply emission.
//!
//! The server is the engine's sole completion handler. On accept it
//! creates a connection and arms a receive; on receive it parses the
//! frame, executes the command against the store, writes the reply, and
//! re-arms the receive; on close it destroys the connection.

mod connection;

pub use connection::{ConnTable, Connection};

use crate::config::Config;
use crate::engine::{Completion, Engine, EngineCtx, EngineError, Handler, Op};
use crate::resp::{self, ParseError, Reply, Value};
use crate::storage::Store;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{Ipv6Addr, SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Listen backlog for the accept queue.
const BACKLOG: i32 = 1024;

/// Upper bound on simultaneously connected clients.
const MAX_CONNECTIONS: usize = 4096;

/// Server startup or runtime failure.
#[derive(Debug)]
pub enum ServerError {
    /// Engine construction failed.
    Engine(EngineError),
    /// The listening socket could not be created or bound.
    Bind(io::Error),
    /// The event loop failed.
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Engine(e) => write!(f, "engine: {e}"),
            ServerError::Bind(e) => write!(f, "bind: {e}"),
            ServerError::Io(e) => write!(f, "event loop: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Engine(e) => Some(e),
            ServerError::Bind(e) | ServerError::Io(e) => Some(e),
        }
    }
}

impl From<EngineError> for ServerError {
    fn from(e: EngineError) -> Self {
        ServerError::Engine(e)
    }
}

/// Run the server until `running` is cleared.
///
/// Builds the engine, binds the listener, arms the first accept, and
/// enters the event loop on the calling thread.
pub fn run(config: &Config, running: Arc<AtomicBool>) -> Result<(), ServerError> {
    let mut engine = Engine::new(
        config.sq_entries,
        config.recv_buffers,
        config.recv_buffer_size,
    )?;

    let listener = bind_listener(config.port).map_err(ServerError::Bind)?;
    info!(port = config.port, "listening");

    let mut server = Server::new(listener);
    engine
        .ctx()
        .accept(server.listener_fd)
        .map_err(ServerError::Io)?;

    engine.enter(&mut server, &running).map_err(ServerError::Io)?;

    info!(
        connections = server.connections.len(),
        keys = server.store.len(),
        "shutting down"
    );
    Ok(())
}

/// Dual-stack listener: IPv6 any-address with `IPV6_V6ONLY` cleared so IPv4
/// clients connect through the same socket, `SO_REUSEPORT` so parallel
/// listeners can share the port.
fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(false)?;
    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let addr = SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port);
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

/// What a processed request asks the dispatch loop to do next.
enum Outcome {
    /// A reply was staged; write it and re-arm the receive.
    Reply,
    /// Nothing to send; just re-arm the receive.
    Silent,
    /// A protocol error was staged; write it and close this client.
    Hangup,
}

/// The server state: listener, live connections, and the store.
pub struct Server {
    // Held for its Drop; the raw fd below is what the engine uses.
    _listener: TcpListener,
    listener_fd: RawFd,
    connections: ConnTable,
    store: Store,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        let listener_fd = listener.as_raw_fd();
        Self {
            _listener: listener,
            listener_fd,
            connections: ConnTable::new(MAX_CONNECTIONS),
            store: Store::new(),
        }
    }

    fn on_accept(&mut self, ctx: &mut EngineCtx<'_>, res: i32) -> io::Result<()> {
        // Keep exactly one accept outstanding while the server runs.
        ctx.accept(self.listener_fd)?;

        // A negative result is an errno, never a descriptor.
        if res < 0 {
            warn!(err = %io::Error::from_raw_os_error(-res), "accept failed");
            return Ok(());
        }

        let fd = res as RawFd;
        let conn = match self.connections.insert(Connection::new(fd)) {
            Some(conn) => conn,
            None => {
                warn!(fd, "connection limit reached, closing");
                return ctx.close(fd, None);
            }
        };

        debug!(conn, fd, "accepted connection");
        ctx.recv(fd, conn)
    }

    fn on_recv(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        conn: usize,
        completion: Completion<'_>,
    ) -> io::Result<()> {
        let fd = match self.connections.get(conn) {
            Some(c) => c.fd,
            // Completion for a connection that is already gone.
            None => return Ok(()),
        };

        if completion.res < 0 {
            debug!(conn, err = %io::Error::from_raw_os_error(-completion.res), "recv failed");
            return ctx.close(fd, Some(conn));
        }
        if completion.res == 0 {
            debug!(conn, "connection closed by peer");
            return ctx.close(fd, Some(conn));
        }

        let data = match completion.buffer {
            Some(data) => data,
            None => {
                warn!(conn, "recv completed without a selected buffer");
                return ctx.close(fd, Some(conn));
            }
        };

        match self.process(conn, data) {
            // The next recv is armed from the write completion, never
            // alongside the write: a pipelining client must not trigger a
            // second `process` call while the kernel can still read the
            // staged reply.
            Outcome::Reply => self.write_reply(ctx, conn, fd),
            Outcome::Silent => ctx.recv(fd, conn),
            Outcome::Hangup => {
                if let Some(c) = self.connections.get_mut(conn) {
                    c.hangup = true;
                }
                self.write_reply(ctx, conn, fd)
            }
        }
    }

    /// Submit the staged reply. Progress and follow-up ops are driven from
    /// the write completion in `on_write`.
    fn write_reply(&mut self, ctx: &mut EngineCtx<'_>, conn: usize, fd: RawFd) -> io::Result<()> {
        let reply = match self.connections.get_mut(conn) {
            Some(c) => {
                c.written = 0;
                &c.reply
            }
            None => return Ok(()),
        };
        ctx.write(fd, reply.as_ptr(), reply.len() as u32, 0, Some(conn))
    }

    fn on_write(&mut self, ctx: &mut EngineCtx<'_>, conn: usize, res: i32) -> io::Result<()> {
        let c = match self.connections.get_mut(conn) {
            Some(c) => c,
            None => return Ok(()),
        };
        let fd = c.fd;

        if res <= 0 {
            if res < 0 {
                debug!(conn, err = %io::Error::from_raw_os_error(-res), "write failed");
            }
            return ctx.close(fd, Some(conn));
        }

        c.written += res as usize;
        if c.written < c.reply.len() {
            // Short write: send the rest before accepting the next request.
            let remaining = (c.reply.len() - c.written) as u32;
            let ptr = unsafe { c.reply.as_ptr().add(c.written) };
            return ctx.write(fd, ptr, remaining, 0, Some(conn));
        }

        if c.hangup {
            return ctx.close(fd, Some(conn));
        }
        ctx.recv(fd, conn)
    }

    fn on_close(&mut self, conn: usize, res: i32) -> io::Result<()> {
        if res < 0 {
            debug!(conn, err = %io::Error::from_raw_os_error(-res), "close failed");
        }
        if let Some(c) = self.connections.remove(conn) {
            debug!(
                conn,
                fd = c.fd,
                lib = c.lib_name.as_deref().unwrap_or(""),
                lib_ver = c.lib_ver.as_deref().unwrap_or(""),
                "connection destroyed"
            );
        }
        Ok(())
    }

    /// Parse one frame from the receive buffer and execute it, staging any
    /// reply in the connection's buffer.
    fn process(&mut self, conn: usize, input: &[u8]) -> Outcome {
        let parsed = resp::parse(input);

        let store = &mut self.store;
        let connection = match self.connections.get_mut(conn) {
            Some(c) => c,
            None => return Outcome::Silent,
        };
        connection.reply.clear();

        let value = match parsed {
            Ok((value, _consumed)) => value,
            Err(e) => {
                // A malformed frame costs this client its connection, not
                // the whole server.
                debug!(conn, err = %e, "protocol error");
                protocol_error(e).encode_into(&mut connection.reply);
                return Outcome::Hangup;
            }
        };

        let reply = match value {
            // Inline commands arrive as a simple string.
            Value::String(line) if starts_with_ignore_case(line, b"PING") => {
                Some(Reply::Simple("PONG"))
            }
            Value::List(items) => execute(store, connection, &items),
            _ => None,
        };

        match reply {
            Some(reply) => {
                reply.encode_into(&mut connection.reply);
                Outcome::Reply
            }
            None => Outcome::Silent,
        }
    }
}

impl Handler for Server {
    fn on_complete(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        op: Op,
        completion: Completion<'_>,
    ) -> io::Result<()> {
        match op {
            Op::Accept => self.on_accept(ctx, completion.res),
            Op::Recv { conn } => self.on_recv(ctx, conn, completion),
            Op::Write { conn } => self.on_write(ctx, conn, completion.res),
            Op::Close { conn } => self.on_close(conn, completion.res),
            Op::Read { .. } => Ok(()),
        }
    }
}

/// Execute a command array. `None` means no reply is sent.
fn execute<'s>(
    store: &'s mut Store,
    connection: &mut Connection,
    items: &[Value<'_>],
) -> Option<Reply<'s>> {
    let name = match items.first() {
        Some(Value::String(name)) => *name,
        // Arrays that do not begin with a command name get no reply.
        _ => return None,
    };

    if name.eq_ignore_ascii_case(b"PING") {
        Some(Reply::Simple("PONG"))
    } else if name.eq_ignore_ascii_case(b"CLIENT") {
        client_command(connection, &items[1..]);
        Some(Reply::Simple("OK"))
    } else if name.eq_ignore_ascii_case(b"SET") {
        match (items.get(1), items.get(2)) {
            (Some(Value::String(key)), Some(Value::String(value))) => {
                store.set(key, value);
                Some(Reply::Simple("OK"))
            }
            _ => Some(wrong_arity("set")),
        }
    } else if name.eq_ignore_ascii_case(b"GET") {
        match items.get(1) {
            Some(Value::String(key)) => Some(
                store
                    .get(key)
                    .map(Reply::Bulk)
                    .unwrap_or(Reply::Nil),
            ),
            _ => Some(wrong_arity("get")),
        }
    } else if name.eq_ignore_ascii_case(b"DEL") {
        let removed = string_args(&items[1..])
            .filter(|key| store.delete(key))
            .count();
        Some(Reply::Integer(removed as i64))
    } else if name.eq_ignore_ascii_case(b"EXISTS") {
        let present = string_args(&items[1..])
            .filter(|key| store.contains(key))
            .count();
        Some(Reply::Integer(present as i64))
    } else {
        // Unknown commands are acknowledged rather than rejected.
        Some(Reply::Simple("OK"))
    }
}

/// `CLIENT` is a stub that always acknowledges, but `SETINFO` attributes
/// are recorded for the disconnect log.
fn client_command(connection: &mut Connection, args: &[Value<'_>]) {
    let sub = match args.first() {
        Some(Value::String(sub)) => *sub,
        _ => return,
    };
    if !sub.eq_ignore_ascii_case(b"SETINFO") {
        return;
    }
    if let (Some(Value::String(attr)), Some(Value::String(value))) = (args.get(1), args.get(2)) {
        let value = String::from_utf8_lossy(value).into_owned();
        if attr.eq_ignore_ascii_case(b"lib-name") {
            connection.lib_name = Some(value);
        } else if attr.eq_ignore_ascii_case(b"lib-ver") {
            connection.lib_ver = Some(value);
        }
    }
}

fn string_args<'a, 'v>(items: &'a [Value<'v>]) -> impl Iterator<Item = &'a [u8]> + 'a {
    items.iter().filter_map(|item| match item {
        Value::String(s) => Some(*s),
        _ => None,
    })
}

fn wrong_arity(command: &str) -> Reply<'static> {
    Reply::Error(format!(
        "ERR wrong number of arguments for '{command}' command"
    ))
}

fn protocol_error(e: ParseError) -> Reply<'static> {
    Reply::Error(format!("ERR Protocol error: {e}"))
}

fn starts_with_ignore_case(haystack: &[u8], prefix: &[u8]) -> bool {
    haystack.len() >= prefix.len() && haystack[..prefix.len()].eq_ignore_ascii_case(prefix)
}
