//! tdskit - an async SQL Server client speaking TDS.
//!
//! ```no_run
//! # async fn run() -> tdskit::Result<()> {
//! let config = tdskit::Config::from_connection_string(
//!     "Server=db.example,1433;Database=sales;User Id=sa;Password=secret",
//! )?;
//! let mut conn = tdskit::Connection::connect(config).await?;
//! let outcome = conn.execute_batch("select 1").await?;
//! println!("{} row(s)", outcome.rows().count());
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod logging;

pub mod error;
pub mod tds;

pub use error::{Result, TdsError};
pub use tds::{
    Authentication, Config, Connection, ConnectionBuilder, ConnectionError, Edition, RequestError, RequestOutcome,
    State,
};
