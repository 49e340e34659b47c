//! Client library for the MonetDB MAPI wire protocol (version 9).
//!
//! ```no_run
//! use monetdb_mapi::Mapi;
//!
//! # fn main() -> monetdb_mapi::Result<()> {
//! let mut mid = Mapi::connect("monetdb://localhost/demo?user=monetdb&password=monetdb")?;
//! let h = mid.query("SELECT name, schema_id FROM sys.tables")?;
//! while mid.fetch_row(h)? > 0 {
//!     let name = mid.fetch_field(h, 0)?.unwrap_or("<null>").to_string();
//!     println!("{name}");
//! }
//! mid.close_handle(h)?;
//! # Ok(())
//! # }
//! ```

mod conn;
mod connect;
pub mod error;
mod params;
pub mod protocol;
mod result;
pub mod settings;
mod stream;
#[cfg(feature = "tls")]
mod tls;
pub mod url;
pub mod urltest;

pub use conn::{HandleId, Mapi, Seek, MAX_REDIRECTS};
pub use error::{Error, Result};
pub use params::{Date, Param, Time, Timestamp};
pub use protocol::QueryType;
pub use result::Column;
pub use settings::{Parm, Settings, TlsVerify};
