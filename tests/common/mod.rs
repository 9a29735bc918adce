//! In-memory database session for integration tests.
//!
//! Understands the handful of statements the pipelines issue: `SHOW
//! DEVICES`, `SHOW TIMESERIES`, `SELECT ... FROM`, multi-row `INSERT` and
//! `DELETE FROM`. `WHERE` clauses are accepted and ignored.

#![allow(dead_code)]

use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use tsbridge::error::SessionError;
use tsbridge::quote::split_last_node;
use tsbridge::{DataType, FieldValue, Row, RowIterator, RowSet, Session};

#[derive(Default)]
struct Device {
    aligned: bool,
    series: IndexMap<String, DataType>,
    rows: BTreeMap<i64, BTreeMap<String, FieldValue>>,
}

#[derive(Default)]
pub struct MemorySession {
    devices: Mutex<IndexMap<String, Device>>,
    statements: Mutex<Vec<String>>,
    row_delay: Option<Duration>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before yielding each selected row.
    pub fn with_row_delay(mut self, delay: Duration) -> Self {
        self.row_delay = Some(delay);
        self
    }

    pub fn create_timeseries(&self, series: &str, data_type: DataType, aligned: bool) {
        let (device, measurement) = split_last_node(series).expect("series path");
        let mut devices = self.devices.lock().unwrap();
        let device = devices.entry(device.to_string()).or_insert_with(|| Device {
            aligned,
            ..Device::default()
        });
        device.series.insert(measurement.to_string(), data_type);
    }

    /// Store one value; the series must exist.
    pub fn put(&self, series: &str, timestamp: i64, value: FieldValue) {
        let (device, measurement) = split_last_node(series).expect("series path");
        let mut devices = self.devices.lock().unwrap();
        let device = devices.get_mut(device).expect("known device");
        device
            .rows
            .entry(timestamp)
            .or_default()
            .insert(measurement.to_string(), value);
    }

    pub fn devices(&self) -> Vec<String> {
        self.devices.lock().unwrap().keys().cloned().collect()
    }

    pub fn is_aligned(&self, device: &str) -> Option<bool> {
        self.devices.lock().unwrap().get(device).map(|d| d.aligned)
    }

    pub fn series_type(&self, series: &str) -> Option<DataType> {
        let (device, measurement) = split_last_node(series)?;
        let devices = self.devices.lock().unwrap();
        devices.get(device)?.series.get(measurement).copied()
    }

    /// Rows of a device as `(timestamp, [(measurement, text)])`, nulls
    /// omitted.
    pub fn dump(&self, device: &str) -> Vec<(i64, Vec<(String, String)>)> {
        let devices = self.devices.lock().unwrap();
        let Some(device) = devices.get(device) else {
            return Vec::new();
        };
        device
            .rows
            .iter()
            .map(|(t, values)| {
                let cells: Vec<(String, String)> = values
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(m, v)| (m.clone(), v.to_string()))
                    .collect();
                (*t, cells)
            })
            .filter(|(_, cells)| !cells.is_empty())
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.devices().iter().map(|d| self.dump(d).len()).sum()
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    fn rows(&self, columns: Vec<String>, rows: Vec<Row>) -> Box<dyn RowIterator> {
        let rows = RowSet::new(columns, rows);
        match self.row_delay {
            Some(delay) => Box::new(SlowRows { rows, delay }),
            None => Box::new(rows),
        }
    }

    fn show_devices(&self, pattern: &str) -> Box<dyn RowIterator> {
        let devices = self.devices.lock().unwrap();
        let rows = devices
            .iter()
            .filter(|(path, _)| matches_path(pattern, path))
            .map(|(path, device)| Row {
                timestamp: None,
                values: vec![
                    FieldValue::Text(path.clone()),
                    FieldValue::Text(device.aligned.to_string()),
                ],
            })
            .collect();
        Box::new(RowSet::new(
            vec!["devices".to_string(), "isAligned".to_string()],
            rows,
        ))
    }

    fn show_timeseries(&self, pattern: &str) -> Box<dyn RowIterator> {
        let devices = self.devices.lock().unwrap();
        let mut rows = Vec::new();
        for (path, device) in devices.iter() {
            for (measurement, data_type) in &device.series {
                let series = format!("{path}.{measurement}");
                if matches_path(pattern, &series) {
                    rows.push(Row {
                        timestamp: None,
                        values: vec![
                            FieldValue::Text(series),
                            FieldValue::Null,
                            FieldValue::Text(data_type.to_string()),
                        ],
                    });
                }
            }
        }
        Box::new(RowSet::new(
            vec![
                "timeseries".to_string(),
                "alias".to_string(),
                "dataType".to_string(),
            ],
            rows,
        ))
    }

    fn select(&self, sql: &str, body: &str) -> Result<Box<dyn RowIterator>, SessionError> {
        let (columns, rest) = body.split_once(" FROM ").ok_or_else(|| query_error(sql))?;
        let path = rest.split(" WHERE ").next().unwrap_or_default().trim();
        let path = unquote(path);

        let devices = self.devices.lock().unwrap();
        let device = devices.get(&path).ok_or_else(|| query_error(sql))?;
        let measurements: Vec<String> = if columns.trim() == "*" {
            device.series.keys().cloned().collect()
        } else {
            columns
                .split(',')
                .map(unquote)
                .filter(|m| device.series.contains_key(m))
                .collect()
        };

        let header = std::iter::once("Time".to_string())
            .chain(measurements.iter().map(|m| format!("{path}.{m}")))
            .collect();
        let rows = device
            .rows
            .iter()
            .map(|(t, values)| Row {
                timestamp: Some(*t),
                values: measurements
                    .iter()
                    .map(|m| values.get(m).cloned().unwrap_or(FieldValue::Null))
                    .collect(),
            })
            .collect();
        drop(devices);
        Ok(self.rows(header, rows))
    }

    fn insert(&self, sql: &str) -> Result<(), SessionError> {
        let insert = parse_insert(sql).ok_or_else(|| statement_error(sql, "malformed insert"))?;
        let mut devices = self.devices.lock().unwrap();
        let device = devices.entry(insert.device.clone()).or_insert_with(|| Device {
            aligned: insert.aligned,
            ..Device::default()
        });

        for tuple in &insert.tuples {
            if tuple.len() != insert.columns.len() + 1 {
                return Err(statement_error(sql, "value count mismatch"));
            }
            let timestamp: i64 = tuple[0]
                .parse()
                .map_err(|_| statement_error(sql, "bad timestamp"))?;
            for (measurement, literal) in insert.columns.iter().zip(&tuple[1..]) {
                let known = device.series.get(measurement).copied();
                let value = parse_literal(literal, known)
                    .ok_or_else(|| statement_error(sql, "bad literal"))?;
                if let (None, Some(data_type)) = (known, value.data_type()) {
                    device.series.insert(measurement.clone(), data_type);
                }
                device
                    .rows
                    .entry(timestamp)
                    .or_default()
                    .insert(measurement.clone(), value);
            }
        }
        Ok(())
    }

    fn delete(&self, body: &str) {
        let pattern = body.split(" WHERE ").next().unwrap_or_default().trim();
        let mut devices = self.devices.lock().unwrap();
        for (path, device) in devices.iter_mut() {
            for values in device.rows.values_mut() {
                values.retain(|m, _| !matches_path(pattern, &format!("{path}.{m}")));
            }
            device.rows.retain(|_, values| !values.is_empty());
        }
    }
}

impl Session for MemorySession {
    fn execute_query(&self, sql: &str) -> Result<Box<dyn RowIterator>, SessionError> {
        if let Some(pattern) = sql.strip_prefix("SHOW DEVICES ") {
            return Ok(self.show_devices(pattern.trim()));
        }
        if let Some(pattern) = sql.strip_prefix("SHOW TIMESERIES ") {
            return Ok(self.show_timeseries(pattern.trim()));
        }
        if let Some(body) = sql.strip_prefix("SELECT ") {
            return self.select(sql, body);
        }
        Err(query_error(sql))
    }

    fn execute_statement(&self, sql: &str) -> Result<(), SessionError> {
        self.statements.lock().unwrap().push(sql.to_string());
        if sql.get(..11).is_some_and(|p| p.eq_ignore_ascii_case("INSERT INTO")) {
            return self.insert(sql);
        }
        if let Some(body) = sql.strip_prefix("DELETE FROM ") {
            self.delete(body);
            return Ok(());
        }
        Err(statement_error(sql, "unsupported statement"))
    }
}

struct SlowRows {
    rows: RowSet,
    delay: Duration,
}

impl Iterator for SlowRows {
    type Item = Result<Row, SessionError>;

    fn next(&mut self) -> Option<Self::Item> {
        std::thread::sleep(self.delay);
        self.rows.next()
    }
}

impl RowIterator for SlowRows {
    fn column_names(&self) -> &[String] {
        self.rows.column_names()
    }
}

fn query_error(sql: &str) -> SessionError {
    SessionError::Query {
        sql: sql.to_string(),
        message: "unsupported query".to_string(),
    }
}

fn statement_error(sql: &str, message: &str) -> SessionError {
    SessionError::Statement {
        sql: sql.to_string(),
        message: message.to_string(),
    }
}

fn unquote(name: &str) -> String {
    let name = name.trim();
    match name.strip_prefix('`').and_then(|n| n.strip_suffix('`')) {
        Some(inner) => inner.replace("``", "`"),
        None => name.to_string(),
    }
}

/// `*` matches one node, `**` one or more.
fn matches_path(pattern: &str, path: &str) -> bool {
    fn go(pattern: &[&str], path: &[&str]) -> bool {
        match (pattern.first(), path.first()) {
            (None, None) => true,
            (Some(&"**"), Some(_)) => go(&pattern[1..], &path[1..]) || go(pattern, &path[1..]),
            (Some(&"*"), Some(_)) => go(&pattern[1..], &path[1..]),
            (Some(p), Some(n)) => unquote(p) == *n && go(&pattern[1..], &path[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let path: Vec<&str> = path.split('.').collect();
    go(&pattern, &path)
}

struct Insert {
    device: String,
    columns: Vec<String>,
    aligned: bool,
    tuples: Vec<Vec<String>>,
}

fn parse_insert(sql: &str) -> Option<Insert> {
    let body = &sql[11..];
    let open = body.find('(')?;
    let device = unquote(&body[..open]);
    let close = open + body[open..].find(')')?;
    let mut columns: Vec<String> = body[open + 1..close].split(',').map(unquote).collect();
    let first = columns.first()?;
    if !first.eq_ignore_ascii_case("timestamp") && !first.eq_ignore_ascii_case("time") {
        return None;
    }
    columns.remove(0);

    let mut rest = body[close + 1..].trim();
    let aligned = rest.get(..7).is_some_and(|w| w.eq_ignore_ascii_case("ALIGNED"));
    if aligned {
        rest = rest[7..].trim();
    }
    if !rest.get(..6).is_some_and(|w| w.eq_ignore_ascii_case("VALUES")) {
        return None;
    }
    let tuples = split_tuples(&rest[6..])?;
    Some(Insert {
        device,
        columns,
        aligned,
        tuples,
    })
}

/// Split `(a,b),(c,d)` into raw literals, honoring double-quoted strings.
fn split_tuples(text: &str) -> Option<Vec<Vec<String>>> {
    let mut tuples = Vec::new();
    let mut current: Option<Vec<String>> = None;
    let mut literal = String::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            literal.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '(' if current.is_none() => current = Some(Vec::new()),
            ')' => {
                let mut tuple = current.take()?;
                tuple.push(std::mem::take(&mut literal).trim().to_string());
                tuples.push(tuple);
            }
            ',' => {
                if let Some(tuple) = current.as_mut() {
                    tuple.push(std::mem::take(&mut literal).trim().to_string());
                }
            }
            '"' if current.is_some() => {
                in_string = true;
                literal.push(c);
            }
            _ if current.is_some() => literal.push(c),
            ' ' => {}
            _ => return None,
        }
    }
    (current.is_none() && !tuples.is_empty()).then_some(tuples)
}

fn parse_literal(raw: &str, known: Option<DataType>) -> Option<FieldValue> {
    if raw.eq_ignore_ascii_case("null") {
        return Some(FieldValue::Null);
    }
    if let Some(inner) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        let mut text = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                text.extend(chars.next().map(|escaped| match escaped {
                    'n' => '\n',
                    'r' => '\r',
                    other => other,
                }));
            } else {
                text.push(c);
            }
        }
        return match known {
            None | Some(DataType::Text) => Some(FieldValue::Text(text)),
            Some(_) => None,
        };
    }
    match known {
        Some(data_type) => FieldValue::parse(raw, data_type).ok(),
        None if raw == "true" || raw == "false" => Some(FieldValue::Boolean(raw == "true")),
        None => raw
            .parse::<i64>()
            .map(FieldValue::Int64)
            .or_else(|_| raw.parse::<f64>().map(FieldValue::Double))
            .ok(),
    }
}
