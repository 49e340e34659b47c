//! The version-9 login exchange: parsing the server challenge, hashing the
//! password, and building the response line.

use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::error::{Error, Result};
use crate::protocol::block::BLOCK;
use crate::protocol::{
    HANDSHAKE_AUTOCOMMIT, HANDSHAKE_COLUMNAR_PROTOCOL, HANDSHAKE_REPLY_SIZE,
    HANDSHAKE_SIZE_HEADER, HANDSHAKE_TIME_ZONE,
};
use crate::settings::{Parm, Settings};

/// Marks a stored password as "already hashed with the server's
/// algorithm", so reconnects do not hash twice.
pub const PASSWORD_HASH_SENTINEL: char = '\u{1}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Ripemd160,
    Sha512,
    Sha384,
    Sha256,
    Sha224,
    Sha1,
}

impl HashAlgo {
    /// Strongest first; the response uses the first of these the server
    /// also supports.
    pub const PREFERENCE: [HashAlgo; 6] = [
        HashAlgo::Ripemd160,
        HashAlgo::Sha512,
        HashAlgo::Sha384,
        HashAlgo::Sha256,
        HashAlgo::Sha224,
        HashAlgo::Sha1,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HashAlgo::Ripemd160 => "RIPEMD160",
            HashAlgo::Sha512 => "SHA512",
            HashAlgo::Sha384 => "SHA384",
            HashAlgo::Sha256 => "SHA256",
            HashAlgo::Sha224 => "SHA224",
            HashAlgo::Sha1 => "SHA1",
        }
    }

    pub fn from_name(name: &str) -> Option<HashAlgo> {
        Self::PREFERENCE.into_iter().find(|a| a.name() == name)
    }

    /// Lowercase hex digest of `data`.
    pub fn digest_hex(self, data: &[u8]) -> String {
        match self {
            HashAlgo::Ripemd160 => hex::encode(Ripemd160::digest(data)),
            HashAlgo::Sha512 => hex::encode(Sha512::digest(data)),
            HashAlgo::Sha384 => hex::encode(Sha384::digest(data)),
            HashAlgo::Sha256 => hex::encode(Sha256::digest(data)),
            HashAlgo::Sha224 => hex::encode(Sha224::digest(data)),
            HashAlgo::Sha1 => hex::encode(Sha1::digest(data)),
        }
    }
}

/// The salted response hash: `hex(H(password_hash ‖ challenge))`.
pub fn hash_password(algo: HashAlgo, password_hash: &str, challenge: &str) -> String {
    let mut input = Vec::with_capacity(password_hash.len() + challenge.len());
    input.extend_from_slice(password_hash.as_bytes());
    input.extend_from_slice(challenge.as_bytes());
    algo.digest_hex(&input)
}

/// The first message the server sends:
/// `challenge:servertype:protover:hashlist:endian:serverhash[:opts[:extras…]]`
#[derive(Debug)]
pub struct Challenge<'a> {
    pub salt: &'a str,
    pub server_type: &'a str,
    /// Comma-separated digest names acceptable in the response.
    pub hash_list: &'a str,
    pub server_bigendian: bool,
    /// Digest the server applied to the stored password.
    pub server_hash: &'a str,
    /// How many per-session settings may ride along in the response.
    pub options_level: i32,
    pub oobintr: bool,
}

pub fn parse_challenge(text: &str) -> Result<Challenge<'_>> {
    if text.is_empty() {
        return Err(Error::Protocol(
            "challenge string is not valid, it is empty".into(),
        ));
    }
    fn field<'a>(fields: &[&'a str], i: usize, what: &str) -> Result<&'a str> {
        fields
            .get(i)
            .copied()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| {
                Error::Protocol(format!("challenge string is not valid, {what} not found"))
            })
    }

    let fields: Vec<&str> = text.split(':').collect();
    let salt = field(&fields, 0, "challenge")?;
    let server_type = field(&fields, 1, "server")?;
    let protover = field(&fields, 2, "protocol")?;
    let pversion: i32 = protover.parse().unwrap_or(0);
    if pversion != 9 {
        return Err(Error::Protocol(format!(
            "unsupported protocol version: {pversion}, this client only supports version 9"
        )));
    }
    let hash_list = fields
        .get(3)
        .copied()
        .filter(|f| !f.is_empty())
        .ok_or_else(|| Error::Protocol("not enough fields in challenge string".into()))?;
    let endian = fields.get(4).copied().unwrap_or("");
    let server_hash = fields.get(5).copied().unwrap_or("");

    let mut options_level = 0;
    if let Some(opts) = fields.get(6).copied().filter(|f| !f.is_empty()) {
        options_level = opts
            .strip_prefix("sql=")
            .and_then(|v| v.parse::<i32>().ok())
            .ok_or_else(|| Error::Protocol("invalid handshake options".into()))?;
    }

    let oobintr = fields.len() > 7 && fields[7..].contains(&"OOBINTR=1");

    Ok(Challenge {
        salt,
        server_type,
        hash_list,
        server_bigendian: endian == "BIG",
        server_hash,
        options_level,
        oobintr,
    })
}

/// Replace a cleartext password with `\x01` + its server-side hash, so the
/// stored secret is what the response hashing actually needs.
pub fn stow_password_hash(settings: &mut Settings, server_hash: &str) -> Result<()> {
    let password = settings.get_str(Parm::Password);
    if password.starts_with(PASSWORD_HASH_SENTINEL) {
        return Ok(());
    }
    let Some(algo) = HashAlgo::from_name(server_hash) else {
        return Err(Error::Auth(format!(
            "server requires unknown hash '{server_hash}'"
        )));
    };
    let hashed = algo.digest_hex(password.as_bytes());
    settings.set_str(Parm::Password, format!("{PASSWORD_HASH_SENTINEL}{hashed}"));
    Ok(())
}

/// Extra connection state that rides along in the response when the
/// server's options level allows.
#[derive(Debug, Clone, Copy)]
pub struct SessionFlags {
    pub sizeheader: bool,
    pub columnar_protocol: bool,
}

/// Build the response line. The stored password must already carry the
/// hash sentinel.
pub fn build_reply(
    settings: &Settings,
    challenge: &Challenge,
    flags: SessionFlags,
) -> Result<String> {
    let user = settings.get_str(Parm::User);
    let stored = settings.get_str(Parm::Password);
    debug_assert!(stored.starts_with(PASSWORD_HASH_SENTINEL));
    let password_hash = &stored[PASSWORD_HASH_SENTINEL.len_utf8()..];

    let mut response = None;
    for algo in HashAlgo::PREFERENCE {
        if challenge.hash_list.split(',').any(|t| t == algo.name()) {
            let pw = hash_password(algo, password_hash, challenge.salt);
            response = Some(format!("{{{}}}{pw}", algo.name()));
            break;
        }
    }
    let Some(response) = response else {
        return Err(Error::Auth(format!(
            "unsupported hash algorithms: {}",
            challenge.hash_list
        )));
    };

    let our_endian = if cfg!(target_endian = "big") {
        "BIG"
    } else {
        "LIT"
    };
    let language = settings.get_str(Parm::Language);
    let database = settings.get_str(Parm::Database);
    let mut reply = format!("{our_endian}:{user}:{response}:{language}:{database}:FILETRANS:");

    let level = challenge.options_level;
    if level > HANDSHAKE_AUTOCOMMIT {
        reply.push_str(&format!(
            "auto_commit={}",
            i32::from(settings.get_bool(Parm::Autocommit))
        ));
    }
    if level > HANDSHAKE_REPLY_SIZE {
        reply.push_str(&format!(",reply_size={}", settings.get_long(Parm::Replysize)));
    }
    if level > HANDSHAKE_SIZE_HEADER {
        // with underscore, despite the X command without
        reply.push_str(&format!(",size_header={}", i32::from(flags.sizeheader)));
    }
    if level > HANDSHAKE_COLUMNAR_PROTOCOL {
        reply.push_str(&format!(
            ",columnar_protocol={}",
            i32::from(flags.columnar_protocol)
        ));
    }
    if level > HANDSHAKE_TIME_ZONE {
        reply.push_str(&format!(",time_zone={}", settings.get_long(Parm::Timezone)));
    }
    if level > 0 {
        reply.push(':');
    }
    reply.push('\n');

    if reply.len() >= BLOCK {
        return Err(Error::Protocol(
            "combination of database name and user name too long".into(),
        ));
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const NO_FLAGS: SessionFlags = SessionFlags {
        sizeheader: false,
        columnar_protocol: false,
    };

    fn login_settings() -> Settings {
        let mut mp = Settings::new();
        mp.set_str(Parm::User, "monetdb");
        mp.set_str(Parm::Password, "secret");
        mp.set_str(Parm::Database, "demo");
        mp
    }

    #[test]
    fn parse_plain_challenge() {
        let ch = parse_challenge("rBuCQ9WTn3:mserver:9:RIPEMD160,SHA256,SHA1:LIT:SHA512:").unwrap();
        assert_eq!(ch.salt, "rBuCQ9WTn3");
        assert_eq!(ch.server_type, "mserver");
        assert_eq!(ch.hash_list, "RIPEMD160,SHA256,SHA1");
        assert!(!ch.server_bigendian);
        assert_eq!(ch.server_hash, "SHA512");
        assert_eq!(ch.options_level, 0);
        assert!(!ch.oobintr);
    }

    #[test]
    fn parse_challenge_with_options_and_extras() {
        let ch = parse_challenge("salt:mserver:9:SHA512:BIG:SHA512:sql=5:BINARY=1:OOBINTR=1").unwrap();
        assert!(ch.server_bigendian);
        assert_eq!(ch.options_level, 5);
        assert!(ch.oobintr);
    }

    #[test]
    fn parse_challenge_errors() {
        assert!(parse_challenge("").is_err());
        assert!(parse_challenge("justsalt").is_err());
        assert!(parse_challenge("salt:mserver").is_err());
        assert!(parse_challenge("salt:mserver:8:SHA512:LIT:SHA512:").is_err());
        assert!(parse_challenge("salt:mserver:9").is_err());
        assert!(parse_challenge("salt:mserver:9:SHA512:LIT:SHA512:lang=3").is_err());
        assert!(parse_challenge("salt:mserver:9:SHA512:LIT:SHA512:sql=x").is_err());
    }

    #[test]
    fn stow_replaces_cleartext_once() {
        let mut mp = login_settings();
        stow_password_hash(&mut mp, "SHA512").unwrap();
        let stored = mp.get_str(Parm::Password).to_string();
        assert!(stored.starts_with('\u{1}'));
        assert_eq!(stored.len(), 1 + 128);
        // idempotent
        stow_password_hash(&mut mp, "SHA512").unwrap();
        assert_eq!(mp.get_str(Parm::Password), stored);
    }

    #[test]
    fn stow_rejects_unknown_server_hash() {
        let mut mp = login_settings();
        assert!(stow_password_hash(&mut mp, "MD5").is_err());
    }

    #[test]
    fn reply_construction_without_level_bits() {
        let mut mp = login_settings();
        let ch = parse_challenge("Xsalt:mserver:9:SHA256,SHA1:LIT:SHA256:").unwrap();
        stow_password_hash(&mut mp, ch.server_hash).unwrap();
        let reply = build_reply(&mp, &ch, NO_FLAGS).unwrap();

        let pwhash = hex::encode(Sha256::digest(b"secret"));
        let salted = hex::encode(Sha256::digest(format!("{pwhash}Xsalt").as_bytes()));
        assert_eq!(reply, format!("LIT:monetdb:{{SHA256}}{salted}:sql:demo:FILETRANS:\n"));
    }

    #[test]
    fn reply_picks_strongest_common_algorithm() {
        let mut mp = login_settings();
        let ch = parse_challenge("s:mserver:9:SHA1,SHA512,SHA256:LIT:SHA256:").unwrap();
        stow_password_hash(&mut mp, ch.server_hash).unwrap();
        let reply = build_reply(&mp, &ch, NO_FLAGS).unwrap();
        assert!(reply.contains("{SHA512}"), "{reply}");
    }

    #[test]
    fn reply_requires_exact_algorithm_tokens() {
        let mut mp = login_settings();
        // "NOTSHA1" must not match SHA1
        let ch = parse_challenge("s:mserver:9:NOTSHA1:LIT:SHA256:").unwrap();
        stow_password_hash(&mut mp, ch.server_hash).unwrap();
        assert!(build_reply(&mp, &ch, NO_FLAGS).is_err());
    }

    #[test]
    fn reply_includes_level_gated_options() {
        let mut mp = login_settings();
        mp.set_bool(Parm::Autocommit, false);
        mp.set_long(Parm::Replysize, 250);
        mp.set_long(Parm::Timezone, 3600);
        let ch = parse_challenge("s:mserver:9:SHA256:LIT:SHA256:sql=5:").unwrap();
        stow_password_hash(&mut mp, ch.server_hash).unwrap();
        let reply = build_reply(
            &mp,
            &ch,
            SessionFlags {
                sizeheader: true,
                columnar_protocol: false,
            },
        )
        .unwrap();
        assert!(
            reply.ends_with(
                ":sql:demo:FILETRANS:auto_commit=0,reply_size=250,size_header=1,columnar_protocol=0,time_zone=3600:\n"
            ),
            "{reply}"
        );
    }

    #[test]
    fn reply_includes_only_permitted_options() {
        let mut mp = login_settings();
        mp.set_bool(Parm::Autocommit, false);
        mp.set_long(Parm::Replysize, 250);
        let ch = parse_challenge("s:mserver:9:SHA256:LIT:SHA256:sql=1:").unwrap();
        stow_password_hash(&mut mp, ch.server_hash).unwrap();
        let reply = build_reply(&mp, &ch, NO_FLAGS).unwrap();
        assert!(reply.ends_with(":sql:demo:FILETRANS:auto_commit=0:\n"), "{reply}");
        assert!(!reply.contains("reply_size"));
    }

    #[test]
    fn oversized_reply_is_rejected() {
        let mut mp = login_settings();
        mp.set_str(Parm::User, "u".repeat(9000));
        let ch = parse_challenge("s:mserver:9:SHA256:LIT:SHA256:").unwrap();
        stow_password_hash(&mut mp, ch.server_hash).unwrap();
        assert!(build_reply(&mp, &ch, NO_FLAGS).is_err());
    }

    #[test]
    fn digest_hex_known_vectors() {
        assert_eq!(
            HashAlgo::Sha1.digest_hex(b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            HashAlgo::Sha256.digest_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            HashAlgo::Ripemd160.digest_hex(b"abc"),
            "8eb208f7e05d987a9b044a8e98c6b087f15a0bfc"
        );
    }
}
