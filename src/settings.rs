//! Typed store for connection parameters.
//!
//! Every parameter the URL grammar knows about lives here, in one of three
//! domains (bool, long, string). Parsing, validation and the derived
//! `connect_*` getters all operate on this one struct; the URL parser and
//! serializer in [`crate::url`] are thin layers on top of it.

use std::borrow::Cow;

use smart_default::SmartDefault;

use crate::error::{Error, Result};

/// Default TCP port when `port` is unset.
pub const DEFAULT_PORT: i64 = 50000;

/// `binary=true` maps to this protocol level, `binary=false` to 0.
const BINARY_SUFFICIENTLY_LARGE: i64 = 65535;

/// A connection parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parm {
    // bool
    Tls,
    Autocommit,
    ClientInfo,
    // long
    Port,
    Timezone,
    Replysize,
    MapToLongVarchar,
    ConnectTimeout,
    ReplyTimeout,
    // string
    Sock,
    Sockdir,
    Cert,
    Clientkey,
    Clientcert,
    Host,
    Database,
    Tableschema,
    Table,
    Certhash,
    User,
    Password,
    Language,
    Schema,
    Binary,
    Logfile,
    ClientApplication,
    ClientRemark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParmClass {
    Bool,
    Long,
    String,
}

/// Result of looking up a parameter name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParmLookup {
    Known(Parm),
    /// Recognized but deliberately without effect (`hash`, `debug`, and any
    /// unknown name containing an underscore, which by convention is an
    /// extension parameter of some other client).
    Ignored,
    Unknown,
}

/// Canonical order in which `write_url` emits query parameters.
/// Credentials and language lead; core parameters are positional in the URL
/// and never appear here.
const ENUMERATION: &[Parm] = &[
    Parm::User,
    Parm::Password,
    Parm::Language,
    Parm::Autocommit,
    Parm::ClientInfo,
    Parm::ClientApplication,
    Parm::ClientRemark,
    Parm::Schema,
    Parm::Binary,
    Parm::Replysize,
    Parm::Timezone,
    Parm::ConnectTimeout,
    Parm::ReplyTimeout,
    Parm::MapToLongVarchar,
    Parm::Sock,
    Parm::Sockdir,
    Parm::Cert,
    Parm::Certhash,
    Parm::Clientkey,
    Parm::Clientcert,
    Parm::Logfile,
];

impl Parm {
    pub fn classify(self) -> ParmClass {
        use Parm::*;
        match self {
            Tls | Autocommit | ClientInfo => ParmClass::Bool,
            Port | Timezone | Replysize | MapToLongVarchar | ConnectTimeout | ReplyTimeout => {
                ParmClass::Long
            }
            _ => ParmClass::String,
        }
    }

    pub fn name(self) -> &'static str {
        use Parm::*;
        match self {
            Tls => "tls",
            Autocommit => "autocommit",
            ClientInfo => "client_info",
            Port => "port",
            Timezone => "timezone",
            Replysize => "replysize",
            MapToLongVarchar => "map_to_long_varchar",
            ConnectTimeout => "connect_timeout",
            ReplyTimeout => "reply_timeout",
            Sock => "sock",
            Sockdir => "sockdir",
            Cert => "cert",
            Clientkey => "clientkey",
            Clientcert => "clientcert",
            Host => "host",
            Database => "database",
            Tableschema => "tableschema",
            Table => "table",
            Certhash => "certhash",
            User => "user",
            Password => "password",
            Language => "language",
            Schema => "schema",
            Binary => "binary",
            Logfile => "logfile",
            ClientApplication => "client_application",
            ClientRemark => "client_remark",
        }
    }

    /// Core parameters are positional in URLs and may not be set through
    /// query parameters.
    pub fn is_core(self) -> bool {
        use Parm::*;
        matches!(self, Tls | Host | Port | Database | Tableschema | Table)
    }

    pub fn lookup(name: &str) -> ParmLookup {
        use Parm::*;
        let parm = match name {
            "tls" => Tls,
            "autocommit" => Autocommit,
            "client_info" => ClientInfo,
            "port" => Port,
            "timezone" => Timezone,
            "replysize" | "fetchsize" => Replysize,
            "map_to_long_varchar" => MapToLongVarchar,
            "connect_timeout" => ConnectTimeout,
            "reply_timeout" => ReplyTimeout,
            "sock" => Sock,
            "sockdir" => Sockdir,
            "cert" => Cert,
            "clientkey" => Clientkey,
            "clientcert" => Clientcert,
            "host" => Host,
            "database" => Database,
            "tableschema" => Tableschema,
            "table" => Table,
            "certhash" => Certhash,
            "user" => User,
            "password" => Password,
            "language" => Language,
            "schema" => Schema,
            "binary" => Binary,
            "logfile" => Logfile,
            "client_application" => ClientApplication,
            "client_remark" => ClientRemark,
            "hash" | "debug" => return ParmLookup::Ignored,
            _ if name.contains('_') => return ParmLookup::Ignored,
            _ => return ParmLookup::Unknown,
        };
        ParmLookup::Known(parm)
    }

    /// All parameters that can appear in a URL query, in canonical order.
    pub fn enumerate() -> impl Iterator<Item = Parm> {
        ENUMERATION.iter().copied()
    }

    /// Every parameter, core ones included.
    pub fn all() -> impl Iterator<Item = Parm> {
        use Parm::*;
        [Tls, Host, Port, Database, Tableschema, Table]
            .into_iter()
            .chain(Parm::enumerate())
    }
}

/// TLS verification policy derived from `tls`, `cert` and `certhash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVerify {
    None,
    System,
    Cert,
    Hash,
}

/// Parse the accepted boolean spellings. `None` means unparseable.
pub fn parse_bool(text: &str) -> Option<bool> {
    const VARIANTS: &[(&str, bool)] = &[
        ("true", true),
        ("false", false),
        ("yes", true),
        ("no", false),
        ("on", true),
        ("off", false),
    ];
    VARIANTS
        .iter()
        .find(|(word, _)| word.eq_ignore_ascii_case(text))
        .map(|&(_, value)| value)
}

type Str = Cow<'static, str>;

/// All properties that affect how a connection is made.
///
/// Created with defaults, mutated through the setters or
/// [`crate::url::parse_url`], and checked by [`Settings::validate`] before
/// the derived `connect_*` getters may be used.
#[derive(Debug, Clone, SmartDefault)]
pub struct Settings {
    #[default = false]
    tls: bool,
    #[default = true]
    autocommit: bool,
    #[default = true]
    client_info: bool,

    #[default(-1)]
    port: i64,
    timezone: i64,
    #[default = 100]
    replysize: i64,
    map_to_long_varchar: i64,
    connect_timeout: i64,
    reply_timeout: i64,

    sock: Str,
    #[default(Cow::Borrowed("/tmp"))]
    sockdir: Str,
    cert: Str,
    clientkey: Str,
    clientcert: Str,
    host: Str,
    database: Str,
    tableschema: Str,
    table: Str,
    certhash: Str,
    user: Str,
    password: Str,
    #[default(Cow::Borrowed("sql"))]
    language: Str,
    schema: Str,
    #[default(Cow::Borrowed("on"))]
    binary: Str,
    logfile: Str,
    client_application: Str,
    client_remark: Str,

    #[default = true]
    lang_is_sql: bool,
    lang_is_mal: bool,
    lang_is_profiler: bool,

    user_generation: u64,
    password_generation: u64,

    validated: bool,
    // precomputed by validate() so the getters can borrow
    unix_sock_name: String,
    certhash_digits: String,
}

impl Settings {
    pub fn new() -> Self {
        Settings::default()
    }

    /// Put every parameter back to its default.
    pub fn reset(&mut self) {
        *self = Settings::default();
    }

    fn bool_slot(&mut self, parm: Parm) -> &mut bool {
        match parm {
            Parm::Tls => &mut self.tls,
            Parm::Autocommit => &mut self.autocommit,
            Parm::ClientInfo => &mut self.client_info,
            _ => unreachable!("{} is not a bool parameter", parm.name()),
        }
    }

    fn long_slot(&mut self, parm: Parm) -> &mut i64 {
        match parm {
            Parm::Port => &mut self.port,
            Parm::Timezone => &mut self.timezone,
            Parm::Replysize => &mut self.replysize,
            Parm::MapToLongVarchar => &mut self.map_to_long_varchar,
            Parm::ConnectTimeout => &mut self.connect_timeout,
            Parm::ReplyTimeout => &mut self.reply_timeout,
            _ => unreachable!("{} is not a long parameter", parm.name()),
        }
    }

    fn string_slot(&mut self, parm: Parm) -> &mut Str {
        match parm {
            Parm::Sock => &mut self.sock,
            Parm::Sockdir => &mut self.sockdir,
            Parm::Cert => &mut self.cert,
            Parm::Clientkey => &mut self.clientkey,
            Parm::Clientcert => &mut self.clientcert,
            Parm::Host => &mut self.host,
            Parm::Database => &mut self.database,
            Parm::Tableschema => &mut self.tableschema,
            Parm::Table => &mut self.table,
            Parm::Certhash => &mut self.certhash,
            Parm::User => &mut self.user,
            Parm::Password => &mut self.password,
            Parm::Language => &mut self.language,
            Parm::Schema => &mut self.schema,
            Parm::Binary => &mut self.binary,
            Parm::Logfile => &mut self.logfile,
            Parm::ClientApplication => &mut self.client_application,
            Parm::ClientRemark => &mut self.client_remark,
            _ => unreachable!("{} is not a string parameter", parm.name()),
        }
    }

    /// Get a bool parameter. Panics when `parm` is not of bool class.
    pub fn get_bool(&self, parm: Parm) -> bool {
        match parm {
            Parm::Tls => self.tls,
            Parm::Autocommit => self.autocommit,
            Parm::ClientInfo => self.client_info,
            _ => unreachable!("{} is not a bool parameter", parm.name()),
        }
    }

    /// Get a long parameter. Panics when `parm` is not of long class.
    pub fn get_long(&self, parm: Parm) -> i64 {
        match parm {
            Parm::Port => self.port,
            Parm::Timezone => self.timezone,
            Parm::Replysize => self.replysize,
            Parm::MapToLongVarchar => self.map_to_long_varchar,
            Parm::ConnectTimeout => self.connect_timeout,
            Parm::ReplyTimeout => self.reply_timeout,
            _ => unreachable!("{} is not a long parameter", parm.name()),
        }
    }

    /// Get a string parameter. Panics when `parm` is not of string class.
    pub fn get_str(&self, parm: Parm) -> &str {
        match parm {
            Parm::Sock => &self.sock,
            Parm::Sockdir => &self.sockdir,
            Parm::Cert => &self.cert,
            Parm::Clientkey => &self.clientkey,
            Parm::Clientcert => &self.clientcert,
            Parm::Host => &self.host,
            Parm::Database => &self.database,
            Parm::Tableschema => &self.tableschema,
            Parm::Table => &self.table,
            Parm::Certhash => &self.certhash,
            Parm::User => &self.user,
            Parm::Password => &self.password,
            Parm::Language => &self.language,
            Parm::Schema => &self.schema,
            Parm::Binary => &self.binary,
            Parm::Logfile => &self.logfile,
            Parm::ClientApplication => &self.client_application,
            Parm::ClientRemark => &self.client_remark,
            _ => unreachable!("{} is not a string parameter", parm.name()),
        }
    }

    pub fn set_bool(&mut self, parm: Parm, value: bool) {
        let slot = self.bool_slot(parm);
        if *slot != value {
            *slot = value;
            self.validated = false;
        }
    }

    pub fn set_long(&mut self, parm: Parm, value: i64) {
        let slot = self.long_slot(parm);
        if *slot != value {
            *slot = value;
            self.validated = false;
        }
    }

    pub fn set_str(&mut self, parm: Parm, value: impl Into<String>) {
        let value: String = value.into();

        // the generation counters tick on every store, changed or not
        match parm {
            Parm::User => self.user_generation += 1,
            Parm::Password => self.password_generation += 1,
            Parm::Language => {
                self.lang_is_mal = value == "mal" || value == "msql";
                self.lang_is_sql = !self.lang_is_mal && value.starts_with("sql");
                self.lang_is_profiler = value.starts_with("profiler");
            }
            _ => {}
        }

        let slot = self.string_slot(parm);
        if &**slot != value.as_str() {
            *slot = Cow::Owned(value);
            self.validated = false;
        }
    }

    /// Parse `text` into the parameter's own type and store it.
    pub fn parse(&mut self, parm: Parm, text: &str) -> Result<()> {
        match parm.classify() {
            ParmClass::Bool => match parse_bool(text) {
                Some(b) => {
                    self.set_bool(parm, b);
                    Ok(())
                }
                None => Err(Error::parse(parm.name(), "invalid boolean value")),
            },
            ParmClass::Long => {
                if text.is_empty() {
                    return Err(Error::parse(
                        parm.name(),
                        "integer parameter cannot be empty string",
                    ));
                }
                match text.parse::<i64>() {
                    Ok(n) => {
                        self.set_long(parm, n);
                        Ok(())
                    }
                    Err(_) => Err(Error::parse(parm.name(), "invalid integer")),
                }
            }
            ParmClass::String => {
                self.set_str(parm, text);
                Ok(())
            }
        }
    }

    /// Render the parameter value as text.
    pub fn as_string(&self, parm: Parm) -> Cow<'_, str> {
        match parm.classify() {
            ParmClass::Bool => Cow::Borrowed(if self.get_bool(parm) { "true" } else { "false" }),
            ParmClass::Long => Cow::Owned(self.get_long(parm).to_string()),
            ParmClass::String => Cow::Borrowed(self.get_str(parm)),
        }
    }

    /// Store a parameter by name. Aliases resolve, ignored names succeed
    /// silently, and core parameters are rejected unless `allow_core`.
    pub fn set_named(&mut self, allow_core: bool, key: &str, value: &str) -> Result<()> {
        let parm = match Parm::lookup(key) {
            ParmLookup::Known(parm) => parm,
            ParmLookup::Ignored => return Ok(()),
            ParmLookup::Unknown => return Err(Error::parse(key, "unknown parameter")),
        };
        if !allow_core && parm.is_core() {
            return Err(Error::parse(parm.name(), "parameter not allowed here"));
        }
        self.parse(parm, value)
    }

    pub fn lang_is_sql(&self) -> bool {
        self.lang_is_sql
    }

    pub fn lang_is_mal(&self) -> bool {
        self.lang_is_mal
    }

    pub fn lang_is_profiler(&self) -> bool {
        self.lang_is_profiler
    }

    /// Incremented on every store of `user`.
    pub fn user_generation(&self) -> u64 {
        self.user_generation
    }

    /// Incremented on every store of `password`.
    pub fn password_generation(&self) -> u64 {
        self.password_generation
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    fn nonempty(&self, parm: Parm) -> bool {
        !self.get_str(parm).is_empty()
    }

    fn validate_certhash(&self) -> Result<String> {
        let certhash = self.get_str(Parm::Certhash);
        if certhash.is_empty() {
            return Ok(String::new());
        }
        let Some(rest) = certhash.strip_prefix("sha256:") else {
            return Err(Error::Validation {
                parameter: "certhash",
                reason: "expected to start with 'sha256:'".into(),
            });
        };
        let mut digits = String::new();
        for c in rest.chars() {
            if c == ':' {
                continue;
            }
            if !c.is_ascii_hexdigit() {
                return Err(Error::Validation {
                    parameter: "certhash",
                    reason: "invalid hex digit".into(),
                });
            }
            digits.push(c.to_ascii_lowercase());
        }
        if digits.is_empty() {
            return Err(Error::Validation {
                parameter: "certhash",
                reason: "need at least one digit".into(),
            });
        }
        Ok(digits)
    }

    /// Check the cross-field invariants and precompute the derived buffers.
    /// Until this succeeds the `connect_*` getters must not be used.
    pub fn validate(&mut self) -> Result<()> {
        if self.validated {
            return Ok(());
        }

        // at least one of sock and host must be empty
        if self.nonempty(Parm::Sock) && self.nonempty(Parm::Host) {
            return Err(Error::Validation {
                parameter: "host",
                reason: format!(
                    "with sock='{}', host must be 'localhost', not '{}'",
                    self.sock, self.host
                ),
            });
        }

        // binary must parse as bool or non-negative integer
        if parse_binary_level(&self.binary) < 0 {
            return Err(Error::Validation {
                parameter: "binary",
                reason: format!("invalid value '{}'", self.binary),
            });
        }

        // a Unix socket cannot carry TLS
        if self.nonempty(Parm::Sock) && self.tls {
            return Err(Error::Validation {
                parameter: "tls",
                reason: "TLS cannot be used with Unix domain sockets".into(),
            });
        }

        let certhash_digits = self.validate_certhash()?;

        if (self.nonempty(Parm::Cert) || self.nonempty(Parm::Certhash)) && !self.tls {
            return Err(Error::Validation {
                parameter: "cert",
                reason: "'cert' and 'certhash' can only be used with monetdbs://".into(),
            });
        }

        for (parm, name) in [
            (Parm::Database, "database"),
            (Parm::Tableschema, "tableschema"),
            (Parm::Table, "table"),
        ] {
            let value = self.get_str(parm);
            if !valid_identifier(value) {
                return Err(Error::Validation {
                    parameter: name,
                    reason: format!("invalid name '{value}'"),
                });
            }
        }

        if self.port != -1 && !(1..=65535).contains(&self.port) {
            return Err(Error::Validation {
                parameter: "port",
                reason: format!("invalid port {}", self.port),
            });
        }

        if self.nonempty(Parm::Clientcert) && !self.nonempty(Parm::Clientkey) {
            return Err(Error::Validation {
                parameter: "clientcert",
                reason: "clientcert can only be set together with clientkey".into(),
            });
        }

        self.unix_sock_name = format!("{}/.s.monetdb.{}", self.sockdir, self.connect_port());
        self.certhash_digits = certhash_digits;
        self.validated = true;
        Ok(())
    }

    /// Whether connecting should scan the socket directory: nothing about
    /// the endpoint is pinned down but a database is named.
    pub fn connect_scan(&self) -> bool {
        self.nonempty(Parm::Database)
            && !self.nonempty(Parm::Sock)
            && !self.nonempty(Parm::Host)
            && self.port == -1
            && !self.tls
    }

    /// The Unix socket path to try, or `""` when TCP should be used.
    pub fn connect_unix(&self) -> &str {
        debug_assert!(self.validated);
        if !self.sock.is_empty() {
            return &self.sock;
        }
        if self.tls {
            return "";
        }
        if self.host.is_empty() {
            // {sockdir}/.s.monetdb.{port}, precomputed by validate()
            return &self.unix_sock_name;
        }
        ""
    }

    /// The TCP host to try, or `""` when a socket path is pinned.
    pub fn connect_tcp(&self) -> &str {
        debug_assert!(self.validated);
        if !self.sock.is_empty() {
            return "";
        }
        if self.host.is_empty() {
            return "localhost";
        }
        &self.host
    }

    pub fn connect_port(&self) -> i64 {
        if self.port == -1 { DEFAULT_PORT } else { self.port }
    }

    pub fn connect_tls_verify(&self) -> TlsVerify {
        debug_assert!(self.validated);
        if !self.tls {
            TlsVerify::None
        } else if !self.certhash.is_empty() {
            // certhash comes before cert
            TlsVerify::Hash
        } else if !self.cert.is_empty() {
            TlsVerify::Cert
        } else {
            TlsVerify::System
        }
    }

    pub fn connect_clientkey(&self) -> &str {
        &self.clientkey
    }

    pub fn connect_clientcert(&self) -> &str {
        if !self.clientcert.is_empty() {
            &self.clientcert
        } else {
            &self.clientkey
        }
    }

    /// The lowercase hex digits of `certhash`, colons stripped.
    pub fn connect_certhash_digits(&self) -> &str {
        debug_assert!(self.validated);
        &self.certhash_digits
    }

    /// Maximum binary result-set level, or a negative value when the
    /// `binary` parameter does not parse.
    pub fn connect_binary(&self) -> i64 {
        parse_binary_level(&self.binary)
    }
}

fn parse_binary_level(text: &str) -> i64 {
    match parse_bool(text) {
        Some(false) => 0,
        Some(true) => BINARY_SUFFICIENTLY_LARGE,
        None => text.parse::<i64>().unwrap_or(-1),
    }
}

/// `[A-Za-z_][A-Za-z0-9._-]*`, empty allowed.
fn valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        None => true,
        Some(first) if first == '_' || first.is_ascii_alphabetic() => name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')),
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_settings() {
        let mp = Settings::new();
        assert!(!mp.get_bool(Parm::Tls));
        assert!(mp.get_bool(Parm::Autocommit));
        assert!(mp.get_bool(Parm::ClientInfo));
        assert_eq!(mp.get_long(Parm::Port), -1);
        assert_eq!(mp.get_long(Parm::Timezone), 0);
        assert_eq!(mp.get_long(Parm::Replysize), 100);
        assert_eq!(mp.get_str(Parm::Sockdir), "/tmp");
        assert_eq!(mp.get_str(Parm::Binary), "on");
        assert_eq!(mp.get_str(Parm::Language), "sql");
        assert_eq!(mp.get_str(Parm::Host), "");
        assert!(mp.lang_is_sql());
        assert!(!mp.lang_is_mal());
    }

    #[test]
    fn parse_bool_spellings() {
        for t in ["true", "TRUE", "yes", "on", "On"] {
            assert_eq!(parse_bool(t), Some(true), "{t}");
        }
        for f in ["false", "no", "off", "OFF"] {
            assert_eq!(parse_bool(f), Some(false), "{f}");
        }
        assert_eq!(parse_bool(""), None);
        assert_eq!(parse_bool("1"), None);
        assert_eq!(parse_bool("superyes"), None);
    }

    #[test]
    fn language_flags() {
        let mut mp = Settings::new();
        mp.set_str(Parm::Language, "mal");
        assert!(mp.lang_is_mal() && !mp.lang_is_sql());
        mp.set_str(Parm::Language, "msql");
        assert!(mp.lang_is_mal());
        mp.set_str(Parm::Language, "sql/somedialect");
        assert!(mp.lang_is_sql() && !mp.lang_is_mal());
        mp.set_str(Parm::Language, "profiler");
        assert!(mp.lang_is_profiler() && !mp.lang_is_sql());
        mp.set_str(Parm::Language, "");
        assert!(!mp.lang_is_sql() && !mp.lang_is_mal() && !mp.lang_is_profiler());
    }

    #[test]
    fn named_aliases_and_ignores() {
        let mut mp = Settings::new();
        mp.set_named(false, "fetchsize", "250").unwrap();
        assert_eq!(mp.get_long(Parm::Replysize), 250);
        // silently ignored
        mp.set_named(false, "hash", "SHA256").unwrap();
        mp.set_named(false, "debug", "1").unwrap();
        mp.set_named(false, "some_unknown_extension", "x").unwrap();
        // unknown without underscore is an error
        assert!(mp.set_named(false, "nosuchparm", "x").is_err());
        // core params need allow_core
        assert!(mp.set_named(false, "host", "db.example.com").is_err());
        mp.set_named(true, "host", "db.example.com").unwrap();
        assert_eq!(mp.get_str(Parm::Host), "db.example.com");
    }

    #[test]
    fn parse_rejects_bad_values() {
        let mut mp = Settings::new();
        assert!(mp.parse(Parm::Autocommit, "maybe").is_err());
        assert!(mp.parse(Parm::Port, "").is_err());
        assert!(mp.parse(Parm::Port, "50k").is_err());
        mp.parse(Parm::Port, "50001").unwrap();
        assert_eq!(mp.get_long(Parm::Port), 50001);
    }

    #[test]
    fn generation_counters_tick_on_every_store() {
        let mut mp = Settings::new();
        let g0 = mp.user_generation();
        mp.set_str(Parm::User, "alice");
        mp.set_str(Parm::User, "alice");
        assert_eq!(mp.user_generation(), g0 + 2);
        let p0 = mp.password_generation();
        mp.set_str(Parm::Password, "secret");
        assert_eq!(mp.password_generation(), p0 + 1);
    }

    #[test]
    fn validation_is_monotonic() {
        let mut mp = Settings::new();
        mp.validate().unwrap();
        assert!(mp.is_validated());
        // storing an identical value must not invalidate
        mp.set_long(Parm::Port, -1);
        mp.set_str(Parm::Sockdir, "/tmp");
        assert!(mp.is_validated());
        // a real change does
        mp.set_long(Parm::Port, 50001);
        assert!(!mp.is_validated());
    }

    #[test]
    fn sock_and_host_conflict() {
        let mut mp = Settings::new();
        mp.set_str(Parm::Sock, "/tmp/.s.monetdb.50000");
        mp.set_str(Parm::Host, "db.example.com");
        assert!(mp.validate().is_err());
        mp.set_str(Parm::Host, "");
        mp.validate().unwrap();
        assert_eq!(mp.connect_unix(), "/tmp/.s.monetdb.50000");
        assert_eq!(mp.connect_tcp(), "");
    }

    #[test]
    fn sock_excludes_tls() {
        let mut mp = Settings::new();
        mp.set_str(Parm::Sock, "/somewhere");
        mp.set_bool(Parm::Tls, true);
        assert!(mp.validate().is_err());
    }

    #[test]
    fn certhash_normalization() {
        let mut mp = Settings::new();
        mp.set_bool(Parm::Tls, true);
        mp.set_str(Parm::Certhash, "sha256:AB:cd:EF");
        mp.validate().unwrap();
        assert_eq!(mp.connect_certhash_digits(), "abcdef");
        assert_eq!(mp.connect_tls_verify(), TlsVerify::Hash);

        mp.set_str(Parm::Certhash, "md5:1234");
        assert!(mp.validate().is_err());
        mp.set_str(Parm::Certhash, "sha256:");
        assert!(mp.validate().is_err());
        mp.set_str(Parm::Certhash, "sha256:xyz");
        assert!(mp.validate().is_err());
    }

    #[test]
    fn cert_requires_tls() {
        let mut mp = Settings::new();
        mp.set_str(Parm::Cert, "/etc/ca.pem");
        assert!(mp.validate().is_err());
        mp.set_bool(Parm::Tls, true);
        mp.validate().unwrap();
        assert_eq!(mp.connect_tls_verify(), TlsVerify::Cert);
    }

    #[test]
    fn identifier_rules() {
        let mut mp = Settings::new();
        for good in ["", "demo", "_t1", "a.b-c_d", "A9"] {
            mp.set_str(Parm::Database, good);
            assert!(mp.validate().is_ok(), "{good:?} should be accepted");
        }
        for bad in ["-demo", "9abc", "a b", "d%b"] {
            mp.set_str(Parm::Database, bad);
            assert!(mp.validate().is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn port_range() {
        let mut mp = Settings::new();
        for good in [-1, 1, 50000, 65535] {
            mp.set_long(Parm::Port, good);
            assert!(mp.validate().is_ok(), "port {good}");
        }
        for bad in [0, -2, 65536] {
            mp.set_long(Parm::Port, bad);
            assert!(mp.validate().is_err(), "port {bad}");
        }
    }

    #[test]
    fn clientcert_requires_clientkey() {
        let mut mp = Settings::new();
        mp.set_str(Parm::Clientcert, "/etc/client.pem");
        assert!(mp.validate().is_err());
        mp.set_str(Parm::Clientkey, "/etc/client.key");
        mp.validate().unwrap();
        assert_eq!(mp.connect_clientcert(), "/etc/client.pem");
        assert_eq!(mp.connect_clientkey(), "/etc/client.key");
        // clientcert defaults to clientkey
        mp.set_str(Parm::Clientcert, "");
        mp.validate().unwrap();
        assert_eq!(mp.connect_clientcert(), "/etc/client.key");
    }

    #[test]
    fn binary_levels() {
        let mut mp = Settings::new();
        assert_eq!(mp.connect_binary(), 65535); // default "on"
        mp.set_str(Parm::Binary, "off");
        assert_eq!(mp.connect_binary(), 0);
        mp.set_str(Parm::Binary, "5");
        assert_eq!(mp.connect_binary(), 5);
        mp.set_str(Parm::Binary, "banana");
        assert!(mp.validate().is_err());
    }

    #[test]
    fn derived_consistency() {
        // spec property: with host and sock empty the unix path is derived
        let mut mp = Settings::new();
        mp.validate().unwrap();
        assert_eq!(mp.connect_tls_verify(), TlsVerify::None);
        assert_eq!(mp.connect_unix(), "/tmp/.s.monetdb.50000");
        assert_eq!(mp.connect_tcp(), "localhost");
        assert_eq!(mp.connect_port(), 50000);

        mp.set_long(Parm::Port, 50001);
        mp.set_str(Parm::Sockdir, "/var/run");
        mp.validate().unwrap();
        assert_eq!(mp.connect_unix(), "/var/run/.s.monetdb.50001");
    }

    #[test]
    fn connect_scan_conditions() {
        let mut mp = Settings::new();
        assert!(!mp.connect_scan()); // no database
        mp.set_str(Parm::Database, "demo");
        assert!(mp.connect_scan());
        mp.set_long(Parm::Port, 50000);
        assert!(!mp.connect_scan());
        mp.set_long(Parm::Port, -1);
        mp.set_str(Parm::Host, "localhost.localdomain");
        assert!(!mp.connect_scan());
        mp.set_str(Parm::Host, "");
        mp.set_bool(Parm::Tls, true);
        assert!(!mp.connect_scan());
    }
}
