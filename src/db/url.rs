//! Database URL helpers.
//!
//! Only the path segment (the database name) is ever rewritten; scheme,
//! credentials, host, port and query are preserved.

use crate::error::{DbError, DbResult};
use url::Url;

/// Database used for administrative connections.
pub const ADMIN_DATABASE: &str = "postgres";

fn parse(database_url: &str) -> DbResult<Url> {
    Url::parse(database_url).map_err(|e| {
        tracing::error!(error = %e, "Unable to parse database url");
        DbError::invalid_input(format!("Invalid URL: {e}"))
    })
}

/// Point `database_url` at `database`.
pub fn replace_db_in_url(database_url: &str, database: &str) -> DbResult<String> {
    let mut url = parse(database_url)?;
    url.set_path(&format!("/{}", database));
    Ok(url.to_string())
}

/// Extract the database name from the URL path.
pub fn db_name(database_url: &str) -> DbResult<String> {
    let url = parse(database_url)?;
    url.path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(String::from)
        .ok_or_else(|| {
            DbError::invalid_input(format!(
                "No database name in URL {}",
                mask_password(database_url)
            ))
        })
}

/// The same server, pointed at the administrative database.
pub fn admin_url(database_url: &str) -> DbResult<String> {
    replace_db_in_url(database_url, ADMIN_DATABASE)
}

/// Check that `name` can be spliced into DDL as a quoted identifier.
///
/// Letters, digits and `_` only, not starting with a digit, at most 63 bytes.
pub fn validate_identifier(name: &str) -> DbResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || name.len() > 63 {
        return Err(DbError::invalid_input(format!(
            "Invalid database name '{}': use letters, digits and '_' only, not starting with a digit",
            name
        )));
    }
    Ok(())
}

/// Render a URL for logs with the password replaced.
pub fn mask_password(database_url: &str) -> String {
    match Url::parse(database_url) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}
