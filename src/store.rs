use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql, Query, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{Result, ViewerError};
use crate::readings::SensorReading;

/// Columns selected from the sensor table, in decode order.
pub const COLUMNS: [&str; 7] = [
    "time",
    "Northing",
    "Easting",
    "Elevation",
    "speed",
    "full_name",
    "Alarma",
];

const TIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S%.f",
];

/// The one query the viewer issues: the first `limit` rows of `table`.
#[derive(Debug, Clone)]
pub struct SensorQuery {
    table: String,
    limit: u32,
}

impl SensorQuery {
    /// Build a query after validating the table name.
    ///
    /// Identifiers cannot be bound as parameters, so each dot-separated
    /// part is checked and bracket-quoted instead.
    pub fn new(table: &str, limit: u32) -> Result<Self> {
        Ok(SensorQuery {
            table: quote_table_name(table)?,
            limit,
        })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// SQL text with the row limit as parameter `@P1`
    pub fn sql(&self) -> String {
        let columns = COLUMNS
            .iter()
            .map(|c| format!("[{}]", c))
            .collect::<Vec<_>>()
            .join(", ");
        format!("SELECT TOP (@P1) {} FROM {}", columns, self.table)
    }
}

fn quote_table_name(table: &str) -> Result<String> {
    let parts: Vec<&str> = table.trim().split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(ViewerError::Config(format!(
            "Table name '{}' must have one to three dot-separated parts",
            table
        )));
    }

    let mut quoted = Vec::with_capacity(parts.len());
    for part in parts {
        let bare = part
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']');
        let valid = !bare.is_empty()
            && bare
                .chars()
                .all(|c| c.is_alphanumeric() || matches!(c, '_' | '$' | '#' | '@' | '-' | ' '));
        if !valid {
            return Err(ViewerError::Config(format!(
                "Invalid identifier '{}' in table name '{}'",
                part, table
            )));
        }
        quoted.push(format!("[{}]", bare));
    }

    Ok(quoted.join("."))
}

/// Read-only connection to the SQL Server holding the sensor table.
pub struct SqlServerStore {
    client: Client<Compat<TcpStream>>,
}

impl SqlServerStore {
    pub async fn connect(db: &DatabaseConfig) -> Result<Self> {
        let config = Self::client_config(db)?;
        info!(addr = %config.get_addr(), database = %db.database, "Connecting to SQL Server");

        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true)?;

        let client = Client::connect(config, tcp.compat_write()).await?;
        Ok(SqlServerStore { client })
    }

    fn client_config(db: &DatabaseConfig) -> Result<Config> {
        if let Some(ref ado) = db.connection_string {
            return Ok(Config::from_ado_string(ado)?);
        }

        let (username, password) = match (&db.username, &db.password) {
            (Some(user), Some(pass)) => (user, pass),
            _ => {
                return Err(ViewerError::Config(
                    "database.username and database.password are required \
                     unless database.connection_string is set"
                        .to_string(),
                ))
            }
        };

        let mut config = Config::new();
        config.host(&db.host);
        config.port(db.port);
        config.database(&db.database);
        config.authentication(AuthMethod::sql_server(username, password));
        if db.trust_cert {
            config.trust_cert();
        }
        Ok(config)
    }

    /// Run the query and decode its first result set.
    pub async fn fetch(&mut self, query: &SensorQuery) -> Result<Vec<SensorReading>> {
        let sql = query.sql();
        debug!(%sql, limit = query.limit(), "Issuing sensor query");

        let mut select = Query::new(sql);
        select.bind(i64::from(query.limit()));

        let rows = select.query(&mut self.client).await?.into_first_result().await?;
        rows.into_iter().map(decode_row).collect()
    }
}

/// Decode one result row in [`COLUMNS`] order.
pub fn decode_row(row: Row) -> Result<SensorReading> {
    reading_from_cells(row.into_iter().collect())
}

pub fn reading_from_cells(cells: Vec<ColumnData<'static>>) -> Result<SensorReading> {
    if cells.len() != COLUMNS.len() {
        return Err(ViewerError::Decode(format!(
            "expected {} columns, got {}",
            COLUMNS.len(),
            cells.len()
        )));
    }

    Ok(SensorReading {
        time: decode_time(&cells[0])?,
        northing: decode_f64(&cells[1])?,
        easting: decode_f64(&cells[2])?,
        elevation: decode_f64(&cells[3])?,
        speed: decode_f64(&cells[4])?,
        full_name: decode_text(&cells[5])?,
        alarm: decode_text(&cells[6])?,
    })
}

/// Numeric value of any numeric-looking column type.
pub fn decode_f64(data: &ColumnData<'static>) -> Result<Option<f64>> {
    let value = match data {
        ColumnData::F64(v) => *v,
        ColumnData::F32(v) => v.map(f64::from),
        ColumnData::U8(v) => v.map(f64::from),
        ColumnData::I16(v) => v.map(f64::from),
        ColumnData::I32(v) => v.map(f64::from),
        ColumnData::I64(v) => v.map(|i| i as f64),
        ColumnData::Bit(v) => v.map(|b| if b { 1.0 } else { 0.0 }),
        ColumnData::Numeric(v) => v
            .as_ref()
            .map(|n| n.value() as f64 / 10f64.powi(n.scale() as i32)),
        ColumnData::String(v) => match v.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) => Some(s.parse::<f64>().map_err(|_| {
                ViewerError::Decode(format!("'{}' is not a number", s))
            })?),
        },
        other => {
            return Err(ViewerError::Decode(format!(
                "unsupported numeric column type: {:?}",
                other
            )))
        }
    };
    Ok(value)
}

/// Timestamp from a date/time column, or from text in a common layout.
pub fn decode_time(data: &ColumnData<'static>) -> Result<Option<NaiveDateTime>> {
    match data {
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            Ok(NaiveDateTime::from_sql(data)?)
        }
        ColumnData::DateTimeOffset(_) => {
            Ok(DateTime::<Utc>::from_sql(data)?.map(|dt| dt.naive_utc()))
        }
        ColumnData::Date(_) => Ok(NaiveDate::from_sql(data)?.and_then(|d| d.and_hms_opt(0, 0, 0))),
        ColumnData::String(v) => match v.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => parse_timestamp(s).map(Some),
        },
        other => Err(ViewerError::Decode(format!(
            "unsupported time column type: {:?}",
            other
        ))),
    }
}

pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.naive_utc());
    }
    for format in TIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(dt);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt);
        }
    }
    Err(ViewerError::Decode(format!("'{}' is not a recognised timestamp", s)))
}

/// Any scalar rendered as text; used for names and alarm codes.
pub fn decode_text(data: &ColumnData<'static>) -> Result<Option<String>> {
    let text = match data {
        ColumnData::String(v) => v.as_ref().map(|s| s.trim().to_string()),
        ColumnData::Bit(v) => v.map(|b| if b { "1".to_string() } else { "0".to_string() }),
        ColumnData::U8(v) => v.map(|i| i.to_string()),
        ColumnData::I16(v) => v.map(|i| i.to_string()),
        ColumnData::I32(v) => v.map(|i| i.to_string()),
        ColumnData::I64(v) => v.map(|i| i.to_string()),
        ColumnData::F32(v) => v.map(|f| f.to_string()),
        ColumnData::F64(v) => v.map(|f| f.to_string()),
        ColumnData::Numeric(v) => v.as_ref().map(|n| n.to_string()),
        ColumnData::Guid(v) => v.as_ref().map(|g| g.to_string()),
        other => {
            return Err(ViewerError::Decode(format!(
                "unsupported text column type: {:?}",
                other
            )))
        }
    };
    Ok(text)
}
