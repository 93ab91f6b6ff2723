use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::calendar::TimeBlock;
use crate::engine::ConfirmRequest;
use crate::model::*;

/// Parsed command from SQL input.
///
/// Writes are `INSERT`s into action tables (`confirmations`, `advances`, ...),
/// one row per command. Reads are `SELECT * FROM <view> [WHERE col = value]`.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVehicle {
        id: Ulid,
        label: Option<String>,
    },
    InsertRequest(NewRequest),
    InsertConfirmation {
        request_id: Ulid,
        confirm: ConfirmRequest,
    },
    InsertRejection {
        request_id: Ulid,
        reason: Option<String>,
    },
    InsertWorkOrder {
        id: Ulid,
        vehicle_id: Ulid,
        work_type: String,
        description: String,
        assignments: Assignments,
    },
    InsertAdvance {
        work_order_id: Ulid,
        status: WorkOrderStatus,
    },
    InsertClosure {
        work_order_id: Ulid,
        signoff: Signoff,
    },
    InsertOverride {
        work_order_id: Ulid,
        status: WorkOrderStatus,
        actor: String,
        reason: String,
    },
    SelectAvailableBlocks {
        date: NaiveDate,
    },
    SelectAvailableDates,
    SelectTimeline {
        request_id: Ulid,
    },
    SelectRequest {
        id: Ulid,
    },
    SelectWorkOrder {
        id: Ulid,
    },
    SelectPendingRequests,
    SelectTransitions {
        entity_id: Ulid,
    },
    SelectVehicles,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Canonical table name and the column order assumed when an INSERT names
/// no columns.
fn default_columns(table: &str) -> Option<(&'static str, &'static [&'static str])> {
    Some(match table {
        "vehicles" => ("vehicles", &["id", "label"]),
        "requests" => (
            "requests",
            &[
                "id",
                "vehicle_id",
                "requester_id",
                "date",
                "block",
                "category",
                "priority",
                "notes",
                "attachments",
            ],
        ),
        "confirmations" => (
            "confirmations",
            &["request_id", "work_type", "date", "block", "employee_id", "bay", "technician"],
        ),
        "rejections" => ("rejections", &["request_id", "reason"]),
        "work_orders" => (
            "work_orders",
            &["id", "vehicle_id", "employee_id", "work_type", "description", "bay", "technician"],
        ),
        "advances" => ("advances", &["work_order_id", "status"]),
        "closures" => ("closures", &["work_order_id", "technician", "note"]),
        "overrides" => ("overrides", &["work_order_id", "status", "actor", "reason"]),
        _ => return None,
    })
}

/// One VALUES row with its column names.
struct Row {
    table: &'static str,
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.required(column)?)
    }

    fn opt_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        match self.get(column).map(text_or_null).transpose()?.flatten() {
            Some(s) => Ok(Some(ulid_from_str(&s)?)),
            None => Ok(None),
        }
    }

    fn text(&self, column: &'static str) -> Result<String, SqlError> {
        text_or_null(self.required(column)?)?.ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn opt_text(&self, column: &str) -> Result<Option<String>, SqlError> {
        Ok(self.get(column).map(text_or_null).transpose()?.flatten())
    }

    fn parsed<T>(&self, column: &'static str) -> Result<T, SqlError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.text(column)?;
        raw.parse().map_err(|e| SqlError::BadValue(column, format!("{e}")))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, defaults) = default_columns(&table).ok_or_else(|| SqlError::UnknownTable(table.clone()))?;
    let values = extract_insert_values(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    if let Some(unknown) = columns.iter().find(|c| !defaults.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(table, unknown.clone()));
    }
    let row = Row {
        table,
        cells: columns.into_iter().zip(values).collect(),
    };

    match table {
        "vehicles" => Ok(Command::InsertVehicle {
            id: row.ulid("id")?,
            label: row.opt_text("label")?,
        }),
        "requests" => Ok(Command::InsertRequest(NewRequest {
            id: row.ulid("id")?,
            vehicle_id: row.ulid("vehicle_id")?,
            requester_id: row.ulid("requester_id")?,
            date: row.parsed("date")?,
            block: row.parsed::<TimeBlock>("block")?,
            category: row.text("category")?,
            priority: match row.opt_text("priority")? {
                Some(p) => p.parse().map_err(|e| SqlError::BadValue("priority", format!("{e}")))?,
                None => Priority::Normal,
            },
            notes: row.opt_text("notes")?,
            attachments: row
                .opt_text("attachments")?
                .map(|list| split_list(&list))
                .unwrap_or_default(),
        })),
        "confirmations" => Ok(Command::InsertConfirmation {
            request_id: row.ulid("request_id")?,
            confirm: ConfirmRequest {
                work_type: row.text("work_type")?,
                date: row.parsed("date")?,
                block: row.parsed("block")?,
                assignments: assignments(&row)?,
            },
        }),
        "rejections" => Ok(Command::InsertRejection {
            request_id: row.ulid("request_id")?,
            reason: row.opt_text("reason")?,
        }),
        "work_orders" => Ok(Command::InsertWorkOrder {
            id: row.ulid("id")?,
            vehicle_id: row.ulid("vehicle_id")?,
            work_type: row.text("work_type")?,
            description: row.text("description")?,
            assignments: assignments(&row)?,
        }),
        "advances" => Ok(Command::InsertAdvance {
            work_order_id: row.ulid("work_order_id")?,
            status: row.parsed("status")?,
        }),
        "closures" => Ok(Command::InsertClosure {
            work_order_id: row.ulid("work_order_id")?,
            signoff: Signoff {
                technician: row.text("technician")?,
                note: row.opt_text("note")?,
            },
        }),
        "overrides" => Ok(Command::InsertOverride {
            work_order_id: row.ulid("work_order_id")?,
            status: row.parsed("status")?,
            actor: row.text("actor")?,
            reason: row.text("reason")?,
        }),
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn assignments(row: &Row) -> Result<Assignments, SqlError> {
    Ok(Assignments {
        employee_id: row.opt_ulid("employee_id")?,
        bay: row.opt_text("bay")?,
        technician: row.opt_text("technician")?,
    })
}

/// Comma-separated attachment references; blanks dropped.
fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filter = |column: &'static str| -> Result<&Expr, SqlError> {
        select
            .selection
            .as_ref()
            .and_then(|sel| find_eq_filter(sel, column))
            .ok_or(SqlError::MissingFilter(column))
    };

    match table.as_str() {
        "available_blocks" => {
            let raw = expr_text(filter("date")?)?;
            let date = raw
                .parse()
                .map_err(|e| SqlError::BadValue("date", format!("{e}")))?;
            Ok(Command::SelectAvailableBlocks { date })
        }
        "available_dates" => Ok(Command::SelectAvailableDates),
        "timeline" => Ok(Command::SelectTimeline {
            request_id: parse_ulid(filter("request_id")?)?,
        }),
        "requests" => Ok(Command::SelectRequest {
            id: parse_ulid(filter("id")?)?,
        }),
        "work_orders" => Ok(Command::SelectWorkOrder {
            id: parse_ulid(filter("id")?)?,
        }),
        "pending_requests" => Ok(Command::SelectPendingRequests),
        "transitions" => Ok(Command::SelectTransitions {
            entity_id: parse_ulid(filter("entity_id")?)?,
        }),
        "vehicles" => Ok(Command::SelectVehicles),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// The right-hand side of `column = value`, searched through `AND` chains.
fn find_eq_filter<'a>(expr: &'a Expr, column: &str) -> Option<&'a Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => find_eq_filter(left, column).or_else(|| find_eq_filter(right, column)),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => Some(right),
        Expr::Nested(inner) => find_eq_filter(inner, column),
        _ => None,
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// The single VALUES row. Multi-row inserts are refused: each row is a
/// separate command with its own outcome.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// A literal as text; `None` for NULL.
fn text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(Value::Boolean(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(SqlError::Parse(format!("expected literal, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn expr_text(expr: &Expr) -> Result<String, SqlError> {
    text_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn ulid_from_str(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    ulid_from_str(&expr_text(expr)?)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("bad {0}: {1}")]
    BadValue(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_vehicle() {
        let cmd = parse_sql(&format!("INSERT INTO vehicles (id, label) VALUES ('{A}', 'Van 7')")).unwrap();
        assert_eq!(
            cmd,
            Command::InsertVehicle {
                id: ulid(A),
                label: Some("Van 7".into())
            }
        );
    }

    #[test]
    fn parse_insert_request_with_defaults() {
        let sql = format!(
            "INSERT INTO requests (id, vehicle_id, requester_id, date, block, category) \
             VALUES ('{A}', '{B}', '{A}', '2026-10-20', '08:00-10:00', 'brakes')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertRequest(r) => {
                assert_eq!(r.id, ulid(A));
                assert_eq!(r.vehicle_id, ulid(B));
                assert_eq!(r.date, NaiveDate::from_ymd_opt(2026, 10, 20).unwrap());
                assert_eq!(r.block, TimeBlock::new(480, 600));
                assert_eq!(r.priority, Priority::Normal);
                assert_eq!(r.notes, None);
                assert!(r.attachments.is_empty());
            }
            other => panic!("expected InsertRequest, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_request_full_positional() {
        let sql = format!(
            "INSERT INTO requests VALUES ('{A}', '{B}', '{A}', '2026-10-20', '14:00-16:00', \
             'electrical', 'urgent', 'battery drains', 'a.jpg, b.jpg,')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertRequest(r) => {
                assert_eq!(r.priority, Priority::Urgent);
                assert_eq!(r.notes.as_deref(), Some("battery drains"));
                assert_eq!(r.attachments, vec!["a.jpg".to_string(), "b.jpg".to_string()]);
            }
            other => panic!("expected InsertRequest, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_request_bad_block() {
        let sql = format!(
            "INSERT INTO requests (id, vehicle_id, requester_id, date, block, category) \
             VALUES ('{A}', '{B}', '{A}', '2026-10-20', '10:00-08:00', 'brakes')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::BadValue("block", _))));
    }

    #[test]
    fn parse_insert_confirmation_with_tags() {
        let sql = format!(
            "INSERT INTO confirmations (request_id, work_type, date, block, employee_id, bay) \
             VALUES ('{A}', 'diagnosis', '2026-10-21', '10:00-12:00', '{B}', 'B3')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertConfirmation {
                request_id: ulid(A),
                confirm: ConfirmRequest {
                    work_type: "diagnosis".into(),
                    date: NaiveDate::from_ymd_opt(2026, 10, 21).unwrap(),
                    block: TimeBlock::new(600, 720),
                    assignments: Assignments {
                        employee_id: Some(ulid(B)),
                        bay: Some("B3".into()),
                        technician: None,
                    },
                },
            }
        );
    }

    #[test]
    fn parse_insert_rejection_and_closure() {
        assert_eq!(
            parse_sql(&format!("INSERT INTO rejections (request_id) VALUES ('{A}')")).unwrap(),
            Command::InsertRejection {
                request_id: ulid(A),
                reason: None
            }
        );
        assert_eq!(
            parse_sql(&format!(
                "INSERT INTO closures (work_order_id, technician, note) VALUES ('{A}', 'ana', NULL)"
            ))
            .unwrap(),
            Command::InsertClosure {
                work_order_id: ulid(A),
                signoff: Signoff {
                    technician: "ana".into(),
                    note: None
                },
            }
        );
    }

    #[test]
    fn parse_insert_advance_and_override() {
        assert_eq!(
            parse_sql(&format!("INSERT INTO advances (work_order_id, status) VALUES ('{A}', 'in_repair')")).unwrap(),
            Command::InsertAdvance {
                work_order_id: ulid(A),
                status: WorkOrderStatus::InRepair
            }
        );
        let sql = format!(
            "INSERT INTO overrides (work_order_id, status, actor, reason) VALUES ('{A}', 'finished', 'admin', 'paper record')"
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertOverride { status: WorkOrderStatus::Finished, .. }
        ));
        let bad = format!("INSERT INTO advances (work_order_id, status) VALUES ('{A}', 'teleported')");
        assert!(matches!(parse_sql(&bad), Err(SqlError::BadValue("status", _))));
    }

    #[test]
    fn parse_insert_work_order() {
        let sql = format!(
            "INSERT INTO work_orders (id, vehicle_id, work_type, description, technician) \
             VALUES ('{A}', '{B}', 'service', 'annual service', 'li')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertWorkOrder { vehicle_id, assignments, .. } => {
                assert_eq!(vehicle_id, ulid(B));
                assert_eq!(assignments.technician.as_deref(), Some("li"));
                assert_eq!(assignments.employee_id, None);
            }
            other => panic!("expected InsertWorkOrder, got {other:?}"),
        }
    }

    #[test]
    fn insert_column_errors() {
        assert!(matches!(
            parse_sql(&format!("INSERT INTO vehicles (id, colour) VALUES ('{A}', 'red')")),
            Err(SqlError::UnknownColumn("vehicles", _))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO advances (status) VALUES ('in_progress')"),
            Err(SqlError::MissingColumn("advances", "work_order_id"))
        ));
        assert!(matches!(
            parse_sql(&format!("INSERT INTO vehicles (id) VALUES ('{A}', 'extra')")),
            Err(SqlError::WrongArity("vehicles", 1, 2))
        ));
        assert!(matches!(
            parse_sql(&format!("INSERT INTO vehicles (id) VALUES ('{A}'), ('{B}')")),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn insert_errors_name_their_own_table() {
        for table in ["vehicles", "requests", "confirmations", "rejections", "work_orders", "advances", "closures"] {
            let sql = format!("INSERT INTO {table} (nonsense) VALUES ('x')");
            match parse_sql(&sql) {
                Err(SqlError::UnknownColumn(t, col)) => {
                    assert_eq!(t, table);
                    assert_eq!(col, "nonsense");
                }
                other => panic!("{table}: expected UnknownColumn, got {other:?}"),
            }
        }
        assert!(matches!(
            parse_sql("INSERT INTO Overrides (reason) VALUES ('x', 'y')"),
            Err(SqlError::WrongArity("overrides", 1, 2))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO override (reason) VALUES ('x')"),
            Err(SqlError::UnknownTable(t)) if t == "override"
        ));
    }

    #[test]
    fn parse_select_available_blocks() {
        assert_eq!(
            parse_sql("SELECT * FROM available_blocks WHERE date = '2026-10-24'").unwrap(),
            Command::SelectAvailableBlocks {
                date: NaiveDate::from_ymd_opt(2026, 10, 24).unwrap()
            }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM available_blocks"),
            Err(SqlError::MissingFilter("date"))
        ));
    }

    #[test]
    fn parse_selects_by_id() {
        assert_eq!(
            parse_sql(&format!("SELECT * FROM timeline WHERE request_id = '{A}'")).unwrap(),
            Command::SelectTimeline { request_id: ulid(A) }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM requests WHERE id = '{A}'")).unwrap(),
            Command::SelectRequest { id: ulid(A) }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM work_orders WHERE (id = '{B}')")).unwrap(),
            Command::SelectWorkOrder { id: ulid(B) }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM transitions WHERE entity_id = '{A}'")).unwrap(),
            Command::SelectTransitions { entity_id: ulid(A) }
        );
    }

    #[test]
    fn parse_unfiltered_views() {
        assert_eq!(parse_sql("SELECT * FROM available_dates").unwrap(), Command::SelectAvailableDates);
        assert_eq!(parse_sql("select * from pending_requests;").unwrap(), Command::SelectPendingRequests);
        assert_eq!(parse_sql("SELECT * FROM vehicles").unwrap(), Command::SelectVehicles);
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql(&format!("INSERT INTO bookings (id) VALUES ('{A}')")),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(parse_sql("SELECT * FROM holds"), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_unsupported_and_empty() {
        assert!(matches!(
            parse_sql(&format!("DELETE FROM requests WHERE id = '{A}'")),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
