//! Connection establishment: candidate discovery, transport selection and
//! the login handshake with redirect handling.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::conn::{HandleId, Mapi, MAX_REDIRECTS};
use crate::error::{Error, Result};
use crate::protocol::block::BlockStream;
use crate::protocol::challenge::{
    build_reply, parse_challenge, stow_password_hash, SessionFlags,
};
use crate::protocol::{HANDSHAKE_AUTOCOMMIT, HANDSHAKE_REPLY_SIZE, HANDSHAKE_SIZE_HEADER,
    HANDSHAKE_TIME_ZONE};
use crate::settings::{Parm, Settings};
use crate::stream::Stream;
use crate::url::parse_url;

/// At most this many sockets are considered during a scan.
const MAX_SCAN: usize = 24;

#[derive(Debug)]
pub(crate) enum HandshakeOutcome {
    Done,
    Redirected,
}

impl Mapi {
    /// Parse a URL, validate it and connect.
    pub fn connect(url: &str) -> Result<Mapi> {
        let mut settings = Settings::new();
        parse_url(&mut settings, url)?;
        settings.validate()?;
        let mut mid = Mapi::new(settings);
        mid.reconnect()?;
        Ok(mid)
    }

    /// (Re-)establish the connection described by the settings.
    pub fn reconnect(&mut self) -> Result<()> {
        self.settings.validate()?;

        let logfile = self.settings.get_str(Parm::Logfile);
        if self.tracelog.is_none() && !logfile.is_empty() {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(logfile)
                .map_err(|e| Error::connect("open log file", e))?;
            self.tracelog = Some(file);
        }

        // if nothing pins down the endpoint, scan the socket directory for
        // servers advertising this database
        if self.settings.connect_scan() {
            self.scan_sockets()
        } else {
            self.establish_connection()
        }
    }

    fn scan_sockets(&mut self) -> Result<()> {
        #[cfg(unix)]
        if self.scan_unix_sockets().is_ok() {
            return Ok(());
        }
        // fall back to TCP on localhost
        self.settings.set_str(Parm::Host, "localhost");
        self.settings.validate()?;
        self.establish_connection()
    }

    #[cfg(unix)]
    fn scan_unix_sockets(&mut self) -> Result<()> {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};

        let sockdir = self.settings.get_str(Parm::Sockdir).to_string();
        self.log_record("CONN", &format!("scanning {sockdir} for Unix domain sockets"));

        let me = unsafe { libc::getuid() };
        let mut candidates: Vec<(i64, u8)> = Vec::new();
        if let Ok(dir) = std::fs::read_dir(&sockdir) {
            for entry in dir.flatten() {
                if candidates.len() >= MAX_SCAN {
                    break;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(portstr) = name.strip_prefix(".s.monetdb.") else {
                    continue;
                };
                if portstr.is_empty() || name.len() > 20 {
                    continue;
                }
                let Ok(port) = portstr.parse::<i64>() else {
                    continue;
                };
                if !(1..=65535).contains(&port) {
                    continue;
                }
                let Ok(meta) = entry.metadata() else { continue };
                if !meta.file_type().is_socket() {
                    continue;
                }
                // ours first, then the others
                candidates.push((port, u8::from(meta.uid() != me)));
            }
        }
        self.log_record(
            "CONN",
            &format!("found {} Unix domain sockets", candidates.len()),
        );

        let original = self.settings.clone();
        for round in 0..2u8 {
            for &(port, priority) in &candidates {
                if priority != round {
                    continue;
                }
                let mut trial = original.clone();
                trial.set_long(Parm::Port, port);
                if trial.validate().is_err() {
                    continue;
                }
                self.settings = trial;
                match self.establish_connection() {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        debug!(target: "mapi::conn", "socket port {port} failed: {e}");
                        // ready to try another one
                    }
                }
            }
        }
        self.settings = original;
        self.log_record(
            "CONN",
            &format!(
                "all {} Unix domain sockets failed, falling back to TCP",
                candidates.len()
            ),
        );
        Err(Error::Connect {
            stage: "socket scan",
            message: format!("no Unix domain socket in {sockdir} accepted the connection"),
        })
    }

    /// Connect and run the handshake, following redirects.
    pub(crate) fn establish_connection(&mut self) -> Result<()> {
        if self.connected {
            self.log_record("CONN", "found leftover open connection");
            self.close_connection();
        }
        loop {
            // a merovingian redirect restarts the handshake on the socket
            // it already has; anything else reconnects
            if !self.connected {
                self.connect_socket()?;
            }
            match self.handshake()? {
                HandshakeOutcome::Done => return Ok(()),
                HandshakeOutcome::Redirected => continue,
            }
        }
    }

    fn connect_socket(&mut self) -> Result<()> {
        debug_assert!(!self.connected);
        let sockname = self.settings.connect_unix().to_string();
        let tcp_host = self.settings.connect_tcp().to_string();
        debug_assert!(!sockname.is_empty() || !tcp_host.is_empty());

        let mut stream = None;
        let mut unix_error = None;
        if !sockname.is_empty() {
            #[cfg(unix)]
            match self.connect_socket_unix(&sockname) {
                Ok(s) => stream = Some(s),
                Err(e) => unix_error = Some(e),
            }
            #[cfg(not(unix))]
            {
                unix_error = Some(Error::Connect {
                    stage: "connect",
                    message: "Unix domain sockets are not supported on this platform".into(),
                });
            }
        }
        let stream = match stream {
            Some(s) => s,
            None if !tcp_host.is_empty() => self.connect_socket_tcp(&tcp_host)?,
            None => {
                return Err(unix_error.unwrap_or(Error::Connect {
                    stage: "connect",
                    message: "nothing to connect to".into(),
                }));
            }
        };

        self.stream = Some(BlockStream::new(stream));
        self.connected = true;

        let reply_timeout = self.settings.get_long(Parm::ReplyTimeout);
        if reply_timeout > 0 {
            self.set_timeout(Some(Duration::from_millis(reply_timeout as u64)))?;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn connect_socket_unix(&mut self, sockname: &str) -> Result<Stream> {
        use std::io::Write as _;
        use std::os::unix::net::UnixStream;

        self.log_record(
            "CONN",
            &format!("connecting to Unix domain socket {sockname}"),
        );
        let mut sock = UnixStream::connect(sockname)
            .map_err(|e| Error::connect("connect to Unix domain socket", e))?;

        // an initial zero (not NUL) tells the server we are not passing a
        // file descriptor
        sock.write_all(b"0")
            .map_err(|e| Error::connect("send initial '0' on Unix domain socket", e))?;

        Ok(Stream::unix(sock))
    }

    fn connect_socket_tcp(&mut self, host: &str) -> Result<Stream> {
        let port = self.settings.connect_port() as u16;
        let use_tls = self.settings.get_bool(Parm::Tls);
        self.log_record("CONN", &format!("connecting to {host}:{port}"));

        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::connect("resolve host name", e))?;

        let connect_timeout = self.settings.get_long(Parm::ConnectTimeout);
        let mut sock = None;
        let mut last_error = None;
        for addr in addrs {
            debug!(target: "mapi::conn", "trying {addr}");
            let attempt = if connect_timeout > 0 {
                TcpStream::connect_timeout(&addr, Duration::from_millis(connect_timeout as u64))
            } else {
                TcpStream::connect(addr)
            };
            match attempt {
                Ok(s) => {
                    sock = Some(s);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }
        let Some(sock) = sock else {
            let err = last_error.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no addresses")
            });
            return Err(Error::connect("connect", err));
        };

        // if our own address equals the peer's we reached our own socket
        if let (Ok(local), Ok(peer)) = (sock.local_addr(), sock.peer_addr()) {
            if local == peer {
                return Err(Error::Connect {
                    stage: "connect",
                    message: "connected to self".into(),
                });
            }
        }
        self.log_record("CONN", "network connection established");

        if use_tls {
            #[cfg(feature = "tls")]
            {
                return crate::tls::wrap_tls(&self.settings, sock);
            }
            #[cfg(not(feature = "tls"))]
            {
                return Err(Error::Connect {
                    stage: "connect",
                    message: "cannot connect to monetdbs://, built without TLS support".into(),
                });
            }
        }
        Ok(Stream::tcp(sock))
    }

    /// One round of the challenge/response exchange on the open stream.
    pub(crate) fn handshake(&mut self) -> Result<HandshakeOutcome> {
        let raw = {
            let stream = self.stream.as_mut().ok_or(Error::Closed)?;
            match stream.read_message() {
                Ok(raw) => raw,
                Err(e) => return Err(self.fail_stream(e, "handshake")),
            }
        };
        self.log_record("RECV HANDSHAKE", &String::from_utf8_lossy(&raw));

        let text = match simdutf8::basic::from_utf8(&raw) {
            Ok(text) => text,
            Err(_) => {
                self.close_connection();
                return Err(Error::Protocol("challenge is not valid UTF-8".into()));
            }
        };
        let challenge = match parse_challenge(text) {
            Ok(challenge) => challenge,
            Err(e) => {
                self.close_connection();
                return Err(e);
            }
        };

        self.handshake_options = challenge.options_level;
        self.oobintr = challenge.oobintr;

        if self.settings.get_str(Parm::User).is_empty()
            || self.settings.get_str(Parm::Password).is_empty()
        {
            self.close_connection();
            return Err(Error::Auth("username and password must be set".into()));
        }

        if let Err(e) = stow_password_hash(&mut self.settings, challenge.server_hash) {
            self.close_connection();
            return Err(e);
        }

        let reply = match build_reply(
            &self.settings,
            &challenge,
            SessionFlags {
                sizeheader: self.sizeheader,
                columnar_protocol: self.columnar_protocol,
            },
        ) {
            Ok(reply) => reply,
            Err(e) => {
                self.close_connection();
                return Err(e);
            }
        };
        let server_bigendian = challenge.server_bigendian;
        drop(challenge);

        if let Some(stream) = self.stream.as_mut() {
            stream.set_bigendian(server_bigendian);
        }
        self.log_record("HANDSHAKE SEND", reply.trim_end());
        self.write_stream(reply.as_bytes(), "handshake")?;
        self.flush_stream("handshake")?;

        // clear the redirects before we receive new ones
        self.redirects.clear();

        // the welcome message is read like any other reply
        let h = self.new_handle();
        self.active = Some(h);
        if let Err(e) = self.read_into_cache(h, 0) {
            self.free_handle(h);
            self.close_connection();
            return Err(e);
        }
        if let Some(err) = self.welcome_error(h) {
            self.free_handle(h);
            self.close_connection();
            return Err(err);
        }

        let mut motd = String::new();
        let mut redirects = Vec::new();
        {
            let hdl = self.handle(h)?;
            if let Some(result) = hdl.result() {
                for line in &result.cache.lines {
                    match line.raw.as_bytes().first() {
                        Some(b'#') => {
                            motd.push_str(&line.raw);
                            motd.push('\n');
                        }
                        Some(b'^') => {
                            if redirects.len() < MAX_REDIRECTS {
                                redirects.push(line.raw[1..].to_string());
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        self.redirects = redirects;
        if !motd.is_empty() {
            self.motd = motd;
        }

        if !self.redirects.is_empty() {
            // a redirect looks like
            //   ^mapi:monetdb://localhost:50001/test?lang=sql&user=monetdb
            // or
            //   ^mapi:merovingian://proxy?database=test
            // we only implement following the first
            if self.redircnt >= self.redirmax {
                self.free_handle(h);
                self.close_connection();
                return Err(Error::Connect {
                    stage: "redirect",
                    message: "too many redirects".into(),
                });
            }
            self.redircnt += 1;
            let red = self.redirects[0].clone();

            let applied = parse_url(&mut self.settings, &red)
                .and_then(|()| self.settings.validate());
            if let Err(e) = applied {
                self.free_handle(h);
                self.close_connection();
                return Err(Error::parse(red, e.to_string()));
            }
            self.free_handle(h);

            if red.starts_with("mapi:merovingian") {
                // keep the socket, restart the handshake on it
                self.log_record("HANDSHAKE", "restarting handshake on current socket");
                debug_assert!(self.connected);
            } else {
                self.log_record("HANDSHAKE", "redirected elsewhere, closing socket");
                self.close_connection();
            }
            return Ok(HandshakeOutcome::Redirected);
        }
        self.close_handle(h)?;

        if !self.settings.lang_is_sql() {
            return Ok(HandshakeOutcome::Done);
        }

        // settings the handshake options level did not cover are synced
        // with X commands, one at a time
        let defaults = Settings::default();
        let autocommit = self.settings.get_bool(Parm::Autocommit);
        if self.handshake_options <= HANDSHAKE_AUTOCOMMIT
            && autocommit != defaults.get_bool(Parm::Autocommit)
        {
            self.xcommand("auto_commit", if autocommit { "1" } else { "0" })?;
        }
        self.auto_commit = autocommit;

        let replysize = self.settings.get_long(Parm::Replysize);
        if self.handshake_options <= HANDSHAKE_REPLY_SIZE
            && replysize != defaults.get_long(Parm::Replysize)
        {
            self.xcommand("reply_size", &replysize.to_string())?;
        }

        if self.handshake_options <= HANDSHAKE_SIZE_HEADER && self.sizeheader {
            self.xcommand("sizeheader", "1")?;
        }

        // columnar_protocol is deliberately not synced here: servers that
        // do not offer it in the handshake do not support it at all
        if self.handshake_options <= HANDSHAKE_TIME_ZONE {
            let timezone = self.settings.get_long(Parm::Timezone);
            self.set_time_zone(timezone)?;
        }

        self.log_record("CONN", "connection established");
        Ok(HandshakeOutcome::Done)
    }

    /// The error carried in the welcome reply, if any. The most relevant
    /// message tends to be in the last produced result.
    fn welcome_error(&self, h: HandleId) -> Option<Error> {
        let hdl = self.handle(h).ok()?;
        let result = hdl.results.iter().rev().find(|r| r.error.is_some())?;
        Some(Error::Server {
            sqlstate: result.sqlstate.clone(),
            message: result
                .error
                .clone()
                .unwrap_or_default()
                .trim_end()
                .to_string(),
        })
    }
}
