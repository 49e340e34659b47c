//! MonetDB URL parsing and rendering.
//!
//! Two grammars are understood: the modern `monetdb://` / `monetdbs://`
//! form with percent-encoding, and the classic `mapi:monetdb://` form
//! (plus `mapi:merovingian://proxy`, which redirect handling feeds back in
//! here). Rendering produces the canonical modern form; for any settings
//! that validate, `parse_url(render)` reproduces every parameter exactly.

use crate::error::{Error, Result};
use crate::settings::{Parm, ParmLookup, Settings};

/// Special characters in the sense of RFC 3986 section 2.2, plus `&` and
/// `=`. `%` is deliberately *not* special.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CharClass {
    NotSpecial,
    GenericSpecial,
    VerySpecial,
}

fn classify(c: u8) -> CharClass {
    match c {
        0 | b'#' | b'&' | b'=' => CharClass::VerySpecial,
        b':' | b'/' | b'?' | b'[' | b']' | b'@' => CharClass::GenericSpecial,
        _ => CharClass::NotSpecial,
    }
}

struct Scanner<'a> {
    url: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(url: &'a str) -> Self {
        Scanner { url, pos: 0 }
    }

    /// The byte we are currently looking at, 0 at end of input.
    fn c(&self) -> u8 {
        self.url.as_bytes().get(self.pos).copied().unwrap_or(0)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn unexpected(&self) -> Error {
        if self.c() == 0 {
            Error::parse("url", "URL ended unexpectedly")
        } else {
            Error::parse(
                "url",
                format!(
                    "unexpected character '{}' at position {}",
                    self.c() as char,
                    self.pos
                ),
            )
        }
    }

    fn consume(&mut self, text: &str) -> Result<()> {
        for expected in text.bytes() {
            if self.c() == expected {
                self.advance();
                continue;
            }
            let reason = if self.c() == 0 {
                format!(
                    "unexpected end at position {}, expected '{}'",
                    self.pos, text
                )
            } else {
                format!(
                    "unexpected character '{}' at position {}, expected '{}'",
                    self.c() as char,
                    self.pos,
                    text
                )
            };
            return Err(Error::parse("url", reason));
        }
        Ok(())
    }

    /// Scan up to the next character at least as special as `level`.
    /// All delimiters are ASCII so the slice is always valid UTF-8.
    fn scan(&mut self, level: CharClass) -> &'a str {
        let start = self.pos;
        while classify(self.c()) < level {
            self.advance();
        }
        &self.url[start..self.pos]
    }

    /// Scan up to one of `delims` or the end of input.
    fn find(&mut self, delims: &[u8]) -> &'a str {
        let start = self.pos;
        while self.c() != 0 && !delims.contains(&self.c()) {
            self.advance();
        }
        &self.url[start..self.pos]
    }

    fn at_end(&self) -> bool {
        // a '#' fragment may trail any URL and is ignored
        self.c() == 0 || self.c() == b'#'
    }
}

fn percent_decode_digit(c: u8) -> i32 {
    match c {
        b'0'..=b'9' => (c - b'0') as i32,
        b'A'..=b'F' => (c - b'A' + 10) as i32,
        b'a'..=b'f' => (c - b'a' + 10) as i32,
        // so negative that it stays negative after combining with
        // another digit
        _ => -1000,
    }
}

fn percent_decode(context: &str, text: &str) -> Result<String> {
    if !text.contains('%') {
        return Ok(text.to_string());
    }
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        if i + 1 >= bytes.len() {
            return Err(Error::parse(
                context,
                "percent escape in URL ends after one digit",
            ));
        }
        let x = bytes[i + 1];
        let y = bytes.get(i + 2).copied().unwrap_or(0);
        let n = 16 * percent_decode_digit(x) + percent_decode_digit(y);
        if n < 0 {
            return Err(Error::parse(context, "invalid percent escape"));
        }
        out.push(n as u8);
        i += 3;
    }
    String::from_utf8(out)
        .map_err(|_| Error::parse(context, "percent escape does not decode to valid UTF-8"))
}

fn store(mp: &mut Settings, parm: Parm, value: &str) -> Result<()> {
    mp.parse(parm, value)
        .map_err(|e| Error::parse("url", format!("cannot set {} to '{value}': {e}", parm.name())))
}

fn parse_port(mp: &mut Settings, sc: &mut Scanner) -> Result<()> {
    if sc.c() == b':' {
        sc.advance();
        let portstr = sc.scan(CharClass::GenericSpecial);
        let port: i64 = portstr.parse().unwrap_or(-1);
        if !(1..=65535).contains(&port) {
            return Err(Error::parse("url", format!("invalid port: '{portstr}'")));
        }
        mp.set_long(Parm::Port, port);
    }
    Ok(())
}

fn parse_path(mp: &mut Settings, sc: &mut Scanner, percent: bool) -> Result<()> {
    for (parm, context) in [
        (Parm::Database, "database"),
        (Parm::Tableschema, "schema"),
        (Parm::Table, "table"),
    ] {
        if sc.c() != b'/' {
            return Ok(());
        }
        sc.advance();
        let raw = sc.scan(CharClass::GenericSpecial);
        let value = if percent {
            percent_decode(context, raw)?
        } else {
            raw.to_string()
        };
        store(mp, parm, &value)?;
    }
    Ok(())
}

fn scan_query_parameter<'a>(sc: &mut Scanner<'a>) -> Result<(&'a str, &'a str)> {
    let key = sc.scan(CharClass::VerySpecial);
    if key.is_empty() {
        return Err(Error::parse("url", "parameter name must not be empty"));
    }
    sc.consume("=")?;
    let value = sc.find(b"&#");
    Ok((key, value))
}

fn parse_modern(mp: &mut Settings, sc: &mut Scanner) -> Result<()> {
    sc.consume("//")?;

    if sc.c() == b'[' {
        sc.advance();
        let start = sc.pos;
        while sc.c() == b':' || sc.c().is_ascii_hexdigit() {
            sc.advance();
        }
        let host = &sc.url[start..sc.pos];
        sc.consume("]")?;
        store(mp, Parm::Host, host)?;
    } else {
        let raw = sc.scan(CharClass::GenericSpecial);
        let decoded = percent_decode("host name", raw)?;
        let host = match decoded.as_str() {
            // "localhost" is how an empty host is spelled out;
            // "localhost." means the literal name
            "localhost" => "",
            "localhost." => "localhost",
            h => {
                if sc.c() == b':' && h.is_empty() {
                    // a port without a host is not allowed: monetdb://:50000
                    return Err(sc.unexpected());
                }
                h
            }
        };
        store(mp, Parm::Host, host)?;
    }

    parse_port(mp, sc)?;
    parse_path(mp, sc, true)?;

    if sc.c() == b'?' {
        loop {
            sc.advance(); // skip ? or &
            let (raw_key, raw_value) = scan_query_parameter(sc)?;
            let key = percent_decode("parameter name", raw_key)?;
            let value = percent_decode(&key, raw_value)?;
            mp.set_named(false, &key, &value)
                .map_err(|e| Error::parse(key.clone(), e.to_string()))?;
            if sc.c() != b'&' {
                break;
            }
        }
    }

    if !sc.at_end() {
        return Err(sc.unexpected());
    }
    Ok(())
}

/// Classic query parameters are whitelisted: only `database` and
/// `language` apply, everything else is ignored. On a merovingian URL an
/// attempt to smuggle in credentials is an error.
fn parse_classic_query_parameters(mp: &mut Settings, sc: &mut Scanner, mero: bool) -> Result<()> {
    debug_assert_eq!(sc.c(), b'?');
    loop {
        sc.advance(); // skip ? or &
        let (key, value) = scan_query_parameter(sc)?;
        match Parm::lookup(key) {
            ParmLookup::Known(parm @ (Parm::Database | Parm::Language)) => {
                let value = value.to_string();
                mp.set_str(parm, value);
            }
            ParmLookup::Known(Parm::User | Parm::Password) if mero => {
                return Err(Error::parse(
                    "url",
                    "MAPI redirect is not allowed to set user or password",
                ));
            }
            _ => {} // ignore
        }
        if sc.c() != b'&' {
            break;
        }
    }
    Ok(())
}

fn parse_classic_tcp(mp: &mut Settings, sc: &mut Scanner) -> Result<()> {
    let host = sc.find(b":?/");
    if host.contains('@') {
        return Err(Error::parse("url", "host@user syntax is not allowed"));
    }
    let host = host.to_string();
    store(mp, Parm::Host, &host)?;

    parse_port(mp, sc)?;
    // the classic path is taken literally, no percent decoding
    parse_path(mp, sc, false)?;

    if sc.c() == b'?' {
        parse_classic_query_parameters(mp, sc, false)?;
    }
    if !sc.at_end() {
        return Err(sc.unexpected());
    }
    Ok(())
}

fn parse_classic_unix(mp: &mut Settings, sc: &mut Scanner) -> Result<()> {
    debug_assert_eq!(sc.c(), b'/');
    let sock = sc.find(b"?").to_string();
    store(mp, Parm::Sock, &sock)?;

    if sc.c() == b'?' {
        parse_classic_query_parameters(mp, sc, false)?;
    }
    if !sc.at_end() {
        return Err(sc.unexpected());
    }
    Ok(())
}

fn parse_classic_merovingian(mp: &mut Settings, sc: &mut Scanner) -> Result<()> {
    sc.consume("mapi:merovingian://proxy")?;
    if sc.c() == b'?' {
        parse_classic_query_parameters(mp, sc, true)?;
    }
    if !sc.at_end() {
        return Err(sc.unexpected());
    }
    Ok(())
}

fn parse_by_scheme(mp: &mut Settings, sc: &mut Scanner) -> Result<()> {
    let scheme = sc.scan(CharClass::GenericSpecial);
    if sc.c() != b':' {
        return Err(Error::parse(
            "url",
            "expected URL starting with monetdb:, monetdbs: or mapi:monetdb:",
        ));
    }
    sc.advance();
    match scheme {
        "monetdb" => {
            mp.set_bool(Parm::Tls, false);
            parse_modern(mp, sc)
        }
        "monetdbs" => {
            mp.set_bool(Parm::Tls, true);
            parse_modern(mp, sc)
        }
        "mapi" => {
            mp.set_bool(Parm::Tls, false);
            sc.consume("monetdb://")?;
            if sc.c() == b'/' {
                parse_classic_unix(mp, sc)
            } else {
                parse_classic_tcp(mp, sc)
            }
        }
        _ => Err(Error::parse(
            "url",
            format!("unknown URL scheme '{scheme}'"),
        )),
    }
}

/// Update `mp` from the URL.
///
/// Non-merovingian URLs are absolute: the core parameters are reset before
/// parsing. `mapi:merovingian://proxy` designates the existing connection,
/// so the core parameters stay and credentials may not change.
pub fn parse_url(mp: &mut Settings, url: &str) -> Result<()> {
    let mut sc = Scanner::new(url);
    let is_mero = url.starts_with("mapi:merovingian:");

    if !is_mero {
        mp.set_bool(Parm::Tls, false);
        mp.set_str(Parm::Host, "");
        mp.set_long(Parm::Port, -1);
        mp.set_str(Parm::Database, "");
        mp.set_str(Parm::Tableschema, "");
        mp.set_str(Parm::Table, "");
    }

    let user_gen = mp.user_generation();
    let password_gen = mp.password_generation();

    if is_mero {
        parse_classic_merovingian(mp, &mut sc)?;
    } else {
        parse_by_scheme(mp, &mut sc)?;
    }

    let user_changed = mp.user_generation() != user_gen;
    let password_changed = mp.password_generation() != password_gen;

    if is_mero && (user_changed || password_changed) {
        return Err(Error::parse(
            "url",
            "MAPI redirect must not change user or password",
        ));
    }

    // a URL that names a user without a password names a *different*
    // login, so any stored password no longer applies
    if user_changed && !password_changed {
        mp.set_str(Parm::Password, "");
    }

    Ok(())
}

// rendering ----------------------------------------------------------------

fn append_escaped(out: &mut String, text: &str, escape_colon: bool) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for c in text.chars() {
        let must_escape = match c {
            '#' | '&' | '=' | '/' | '?' | '[' | ']' | '@' | '%' => true,
            ':' => escape_colon,
            _ => false,
        };
        if must_escape {
            let b = c as u8;
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0f) as usize] as char);
        } else {
            out.push(c);
        }
    }
}

/// Render the canonical URL for `mp`.
pub fn url_string(mp: &Settings) -> String {
    let mut out = String::new();

    out.push_str(if mp.get_bool(Parm::Tls) {
        "monetdbs"
    } else {
        "monetdb"
    });
    out.push_str("://");

    let host = mp.get_str(Parm::Host);
    if host.is_empty() {
        out.push_str("localhost");
    } else if host == "localhost" {
        out.push_str("localhost.");
    } else if host.contains(':') {
        out.push('[');
        append_escaped(&mut out, host, false);
        out.push(']');
    } else {
        append_escaped(&mut out, host, true);
    }

    let port = mp.get_long(Parm::Port);
    if (1..=65535).contains(&port) && port != crate::settings::DEFAULT_PORT {
        out.push_str(&format!(":{port}"));
    }

    // a deeper path level forces the shallower segments to appear
    let database = mp.get_str(Parm::Database);
    let tableschema = mp.get_str(Parm::Tableschema);
    let table = mp.get_str(Parm::Table);
    let include_table = !table.is_empty();
    let include_schema = !tableschema.is_empty() || include_table;
    let include_database = !database.is_empty() || include_schema;
    if include_database {
        out.push('/');
        append_escaped(&mut out, database, true);
    }
    if include_schema {
        out.push('/');
        append_escaped(&mut out, tableschema, true);
    }
    if include_table {
        out.push('/');
        append_escaped(&mut out, table, true);
    }

    let defaults = Settings::default();
    let mut sep = '?';
    for parm in Parm::enumerate() {
        let value = mp.as_string(parm);
        if value == defaults.as_string(parm) {
            continue;
        }
        out.push(sep);
        sep = '&';
        out.push_str(parm.name());
        out.push('=');
        append_escaped(&mut out, &value, true);
    }

    out
}

/// Render the canonical URL into `buffer`.
///
/// The result is always NUL terminated when the buffer is not empty, even
/// if that means truncating. Returns the number of bytes that were (or
/// would have been) written, excluding the NUL.
pub fn write_url(mp: &Settings, buffer: &mut [u8]) -> usize {
    let url = url_string(mp);
    let bytes = url.as_bytes();
    if !buffer.is_empty() {
        let n = bytes.len().min(buffer.len() - 1);
        buffer[..n].copy_from_slice(&bytes[..n]);
        buffer[n] = 0;
    }
    bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TlsVerify;
    use pretty_assertions::assert_eq;

    fn parsed(url: &str) -> Settings {
        let mut mp = Settings::new();
        parse_url(&mut mp, url).unwrap_or_else(|e| panic!("{url}: {e}"));
        mp
    }

    fn roundtrip(mp: &Settings) {
        let url = url_string(mp);
        let mut reparsed = Settings::new();
        parse_url(&mut reparsed, &url).unwrap_or_else(|e| panic!("{url}: {e}"));
        for parm in Parm::enumerate() {
            assert_eq!(
                mp.as_string(parm),
                reparsed.as_string(parm),
                "{} differs after round-trip of {url}",
                parm.name()
            );
        }
        for parm in [
            Parm::Tls,
            Parm::Host,
            Parm::Port,
            Parm::Database,
            Parm::Tableschema,
            Parm::Table,
        ] {
            assert_eq!(
                mp.as_string(parm),
                reparsed.as_string(parm),
                "core {} differs after round-trip of {url}",
                parm.name()
            );
        }
    }

    #[test]
    fn modern_with_ipv6_and_query() {
        let mp = parsed("monetdbs://[::1]:50001/db1/s1/t1?user=alice&replysize=500");
        assert!(mp.get_bool(Parm::Tls));
        assert_eq!(mp.get_str(Parm::Host), "::1");
        assert_eq!(mp.get_long(Parm::Port), 50001);
        assert_eq!(mp.get_str(Parm::Database), "db1");
        assert_eq!(mp.get_str(Parm::Tableschema), "s1");
        assert_eq!(mp.get_str(Parm::Table), "t1");
        assert_eq!(mp.get_str(Parm::User), "alice");
        assert_eq!(mp.get_long(Parm::Replysize), 500);
        assert_eq!(
            url_string(&mp),
            "monetdbs://[::1]:50001/db1/s1/t1?user=alice&replysize=500"
        );
    }

    #[test]
    fn classic_query_is_whitelisted() {
        let mut mp = Settings::new();
        mp.set_str(Parm::User, "original");
        parse_url(&mut mp, "mapi:monetdb://srv:50000/demo?language=sql&user=bob").unwrap();
        assert_eq!(mp.get_str(Parm::User), "original");
        assert_eq!(mp.get_str(Parm::Database), "demo");
        assert_eq!(mp.get_str(Parm::Language), "sql");
        assert_eq!(mp.get_str(Parm::Host), "srv");
        assert_eq!(mp.get_long(Parm::Port), 50000);
    }

    #[test]
    fn classic_unix_socket() {
        let mp = parsed("mapi:monetdb:///var/run/monetdb/.s.monetdb.50000?database=demo");
        assert_eq!(mp.get_str(Parm::Sock), "/var/run/monetdb/.s.monetdb.50000");
        assert_eq!(mp.get_str(Parm::Database), "demo");
    }

    #[test]
    fn localhost_normalization() {
        let mp = parsed("monetdb://localhost/x");
        assert_eq!(mp.get_str(Parm::Host), "");
        assert_eq!(url_string(&mp), "monetdb://localhost/x");

        let mp = parsed("monetdb://localhost./x");
        assert_eq!(mp.get_str(Parm::Host), "localhost");
        assert_eq!(url_string(&mp), "monetdb://localhost./x");
    }

    #[test]
    fn merovingian_must_not_change_credentials() {
        let mut mp = Settings::new();
        mp.set_str(Parm::User, "u1");
        mp.set_str(Parm::Password, "p1");
        let err = parse_url(&mut mp, "mapi:merovingian://proxy?user=u2").unwrap_err();
        assert!(err.to_string().contains("not allowed to set user"), "{err}");

        // the plain form keeps the current core settings
        let mut mp = Settings::new();
        mp.set_str(Parm::Host, "srv");
        mp.set_str(Parm::Database, "demo");
        parse_url(&mut mp, "mapi:merovingian://proxy").unwrap();
        assert_eq!(mp.get_str(Parm::Host), "srv");
        assert_eq!(mp.get_str(Parm::Database), "demo");

        // database may be changed by the proxy
        parse_url(&mut mp, "mapi:merovingian://proxy?database=other").unwrap();
        assert_eq!(mp.get_str(Parm::Database), "other");
    }

    #[test]
    fn setting_user_clears_password() {
        let mut mp = Settings::new();
        mp.set_str(Parm::User, "u1");
        mp.set_str(Parm::Password, "p1");
        parse_url(&mut mp, "monetdb://h/db?user=u2").unwrap();
        assert_eq!(mp.get_str(Parm::User), "u2");
        assert_eq!(mp.get_str(Parm::Password), "");

        // but not when the URL also sets one
        let mut mp = Settings::new();
        mp.set_str(Parm::User, "u1");
        mp.set_str(Parm::Password, "p1");
        parse_url(&mut mp, "monetdb://h/db?user=u2&password=p2").unwrap();
        assert_eq!(mp.get_str(Parm::Password), "p2");
    }

    #[test]
    fn parsing_is_absolute_not_cumulative() {
        let mut mp = Settings::new();
        parse_url(&mut mp, "monetdbs://h1:50001/db1/s1/t1").unwrap();
        parse_url(&mut mp, "monetdb://h2/db2").unwrap();
        assert!(!mp.get_bool(Parm::Tls));
        assert_eq!(mp.get_str(Parm::Host), "h2");
        assert_eq!(mp.get_long(Parm::Port), -1);
        assert_eq!(mp.get_str(Parm::Database), "db2");
        assert_eq!(mp.get_str(Parm::Tableschema), "");
        assert_eq!(mp.get_str(Parm::Table), "");
    }

    #[test]
    fn percent_decoding() {
        let mp = parsed("monetdb://h/db?user=a%26b&client_remark=x%3dy%20z");
        assert_eq!(mp.get_str(Parm::User), "a&b");
        assert_eq!(mp.get_str(Parm::ClientRemark), "x=y z");

        let mut mp = Settings::new();
        assert!(parse_url(&mut mp, "monetdb://h/db?user=a%2").is_err());
        assert!(parse_url(&mut mp, "monetdb://h/db?user=a%zz").is_err());
        assert!(parse_url(&mut mp, "monetdb://h/db?user=a%").is_err());
    }

    #[test]
    fn classic_path_is_not_decoded() {
        // %41 stays literal in a classic path; as a database name it then
        // fails the identifier check at validation time, so use the host
        let mp = parsed("mapi:monetdb://h%41st:50000/demo");
        assert_eq!(mp.get_str(Parm::Host), "h%41st");
    }

    #[test]
    fn rejects() {
        for url in [
            "monetdb:",
            "monetdb:xyz",
            "postgres://localhost",
            "monetdb://:50000",
            "monetdb://h:0/db",
            "monetdb://h:70000/db",
            "monetdb://h:12x/db",
            "monetdb://h/db?=x",
            "monetdb://h/db?user",
            "monetdb://h/db?nosuchparm=1",
            "monetdb://h/db?port=123",
            "monetdb://[0:0/db",
            "mapi:monetdb://user@host/db",
        ] {
            let mut mp = Settings::new();
            assert!(parse_url(&mut mp, url).is_err(), "{url} should fail");
        }
    }

    #[test]
    fn fragment_is_ignored() {
        let mp = parsed("monetdb://h/db#fragment");
        assert_eq!(mp.get_str(Parm::Database), "db");
    }

    #[test]
    fn path_depth_forces_shallower_segments() {
        let mut mp = Settings::new();
        mp.set_str(Parm::Table, "t");
        assert_eq!(url_string(&mp), "monetdb://localhost///t");
        roundtrip(&mp);

        let mut mp = Settings::new();
        mp.set_str(Parm::Tableschema, "s");
        assert_eq!(url_string(&mp), "monetdb://localhost//s");
        roundtrip(&mp);
    }

    #[test]
    fn roundtrip_various() {
        for url in [
            "monetdb://localhost",
            "monetdb://localhost./x",
            "monetdbs://[::1]:50001/db1/s1/t1?user=alice&replysize=500",
            "monetdb://h:12345/db?user=a%26b&password=s3cr3t",
            "monetdbs://db.example.com/demo?cert=%2Fetc%2Fca.pem",
            "monetdb://h/db?timezone=-3600&autocommit=false",
            "monetdb://h/db?language=mal&binary=3",
            "monetdb://h/db?sockdir=%2Fvar%2Frun",
        ] {
            let mut mp = Settings::new();
            parse_url(&mut mp, url).unwrap_or_else(|e| panic!("{url}: {e}"));
            roundtrip(&mp);
        }
    }

    #[test]
    fn canonical_query_order() {
        let mut mp = Settings::new();
        mp.set_long(Parm::Replysize, 500);
        mp.set_str(Parm::User, "alice");
        mp.set_str(Parm::Language, "mal");
        let url = url_string(&mp);
        assert_eq!(url, "monetdb://localhost?user=alice&language=mal&replysize=500");
    }

    #[test]
    fn write_url_truncation_contract() {
        let mut mp = Settings::new();
        parse_url(
            &mut mp,
            "monetdbs://[::1]:50001/db1/s1/t1?user=alice&replysize=500",
        )
        .unwrap();
        let mut full = [0u8; 256];
        let len = write_url(&mp, &mut full);
        assert!(len > 0 && len < 255);
        assert_eq!(full[len], 0);
        let rendered = full[..len].to_vec();

        for k in 1..=len {
            let mut buf = vec![0xaau8; k + 8];
            let n = write_url(&mp, &mut buf[..k]);
            assert_eq!(n, len, "length must not depend on the buffer size");
            assert_eq!(buf[k - 1], 0, "buffer of size {k} must be NUL terminated");
            assert_eq!(
                &buf[..k - 1],
                &rendered[..k - 1],
                "truncated write must be a prefix"
            );
            assert!(
                buf[k..].iter().all(|&b| b == 0xaa),
                "must not write past the buffer"
            );
        }
        // zero-sized buffer: nothing written, length still returned
        assert_eq!(write_url(&mp, &mut []), len);
    }

    #[test]
    fn validated_scenario_s5_url_form() {
        let mut mp = parsed("monetdbs://h/db?certhash=sha256:AB:cd:EF");
        mp.validate().unwrap();
        assert_eq!(mp.connect_certhash_digits(), "abcdef");
        assert_eq!(mp.connect_tls_verify(), TlsVerify::Hash);
    }
}
