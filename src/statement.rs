//! Query text issued to the database.
//!
//! Every identifier passes through [`format_path`] before it is embedded.

use crate::model::EntityDescriptor;
use crate::quote::format_path;

pub fn show_devices(path: &str) -> String {
    format!("SHOW DEVICES {}", format_path(path))
}

pub fn show_timeseries(path: &str) -> String {
    format!("SHOW TIMESERIES {}", format_path(path))
}

/// Every series directly under `device`.
pub fn show_device_timeseries(device: &str) -> String {
    format!("SHOW TIMESERIES {}.*", format_path(device))
}

pub fn select(device: &str, measurements: &[String], where_clause: Option<&str>) -> String {
    let columns = if measurements.is_empty() {
        "*".to_string()
    } else {
        measurements
            .iter()
            .map(|m| format_path(m))
            .collect::<Vec<_>>()
            .join(",")
    };
    let mut sql = format!("SELECT {columns} FROM {}", format_path(device));
    push_where(&mut sql, where_clause);
    sql
}

pub fn delete(path: &str, where_clause: Option<&str>) -> String {
    let mut sql = format!("DELETE FROM {}", format_path(path));
    push_where(&mut sql, where_clause);
    sql
}

fn push_where(sql: &mut String, where_clause: Option<&str>) {
    if let Some(clause) = where_clause.map(str::trim).filter(|c| !c.is_empty()) {
        sql.push_str(" WHERE ");
        sql.push_str(clause);
    }
}

/// Multi-row `INSERT` with one shared column list.
///
/// `rows` holds a timestamp and one rendered literal per column; a `None`
/// literal is written as `null`.
pub fn insert<'a, I>(entity: &EntityDescriptor, columns: &[String], rows: I) -> String
where
    I: IntoIterator<Item = (i64, &'a [Option<String>])>,
{
    let mut sql = format!("INSERT INTO {}(timestamp", format_path(entity.name()));
    for column in columns {
        sql.push(',');
        sql.push_str(&format_path(column));
    }
    sql.push(')');
    if entity.aligned {
        sql.push_str(" ALIGNED");
    }
    sql.push_str(" VALUES ");

    for (i, (timestamp, literals)) in rows.into_iter().enumerate() {
        if i > 0 {
            sql.push(',');
        }
        sql.push('(');
        sql.push_str(&timestamp.to_string());
        for literal in literals {
            sql.push(',');
            sql.push_str(literal.as_deref().unwrap_or("null"));
        }
        sql.push(')');
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_quotes_measurements() {
        let sql = select(
            "root.sg.d1",
            &["s1".to_string(), "1".to_string()],
            Some("time > 10"),
        );
        assert_eq!(sql, "SELECT s1,`1` FROM root.sg.d1 WHERE time > 10");
        assert_eq!(select("root.sg.d1", &[], None), "SELECT * FROM root.sg.d1");
    }

    #[test]
    fn test_delete_with_and_without_clause() {
        assert_eq!(
            delete("root.sg.d1.*", Some("time <= 100")),
            "DELETE FROM root.sg.d1.* WHERE time <= 100"
        );
        assert_eq!(delete("root.sg.d1.*", Some("  ")), "DELETE FROM root.sg.d1.*");
    }

    #[test]
    fn test_insert_statement() {
        let entity = EntityDescriptor::new("root.sg.d1", true);
        let columns = vec!["s1".to_string(), "select".to_string()];
        let first = vec![Some("1".to_string()), Some("\"a\"".to_string())];
        let second = vec![None, Some("\"b\"".to_string())];
        let sql = insert(
            &entity,
            &columns,
            [(10, first.as_slice()), (20, second.as_slice())],
        );
        assert_eq!(
            sql,
            "INSERT INTO root.sg.d1(timestamp,s1,`select`) ALIGNED VALUES (10,1,\"a\"),(20,null,\"b\")"
        );
    }

    #[test]
    fn test_show_statements() {
        assert_eq!(show_devices("root.sg.**"), "SHOW DEVICES root.sg.**");
        assert_eq!(
            show_device_timeseries("root.sg.d1"),
            "SHOW TIMESERIES root.sg.d1.*"
        );
        assert_eq!(show_timeseries("root.**"), "SHOW TIMESERIES root.**");
    }
}
