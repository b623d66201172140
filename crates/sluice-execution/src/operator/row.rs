use std::cmp::Ordering;

use bytes::Bytes;
use prost::Message;

use crate::error::{ExecutionError, ExecutionResult};
use crate::plan::rpc::value::Kind;
use crate::plan::rpc::ValueList;
use crate::plan::{Order, OrderBy, Row, Value};

/// Encode a row as one pipe frame.
pub fn encode_row(row: &Row) -> Bytes {
    row.encode_to_vec().into()
}

pub fn decode_row(frame: &[u8]) -> ExecutionResult<Row> {
    Ok(Row::decode(frame)?)
}

pub fn null() -> Value {
    Value { kind: None }
}

pub fn boolean(x: bool) -> Value {
    Value {
        kind: Some(Kind::Boolean(x)),
    }
}

pub fn integer(x: i64) -> Value {
    Value {
        kind: Some(Kind::Integer(x)),
    }
}

pub fn real(x: f64) -> Value {
    Value {
        kind: Some(Kind::Real(x)),
    }
}

pub fn text(x: impl Into<String>) -> Value {
    Value {
        kind: Some(Kind::Text(x.into())),
    }
}

pub fn blob(x: impl Into<Vec<u8>>) -> Value {
    Value {
        kind: Some(Kind::Blob(x.into())),
    }
}

pub fn list(values: Vec<Value>) -> Value {
    Value {
        kind: Some(Kind::List(ValueList { values })),
    }
}

pub fn row(columns: Vec<Value>) -> Row {
    Row { columns }
}

fn kind_rank(kind: &Option<Kind>) -> u8 {
    match kind {
        None => 0,
        Some(Kind::Boolean(_)) => 1,
        Some(Kind::Integer(_)) | Some(Kind::Real(_)) => 2,
        Some(Kind::Text(_)) => 3,
        Some(Kind::Blob(_)) => 4,
        Some(Kind::List(_)) => 5,
    }
}

/// Total order over values: null, then booleans, then numbers (integers
/// and floats compare numerically across kinds), then text, then bytes,
/// then lists (lexicographic).
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (&left.kind, &right.kind) {
        (Some(Kind::Boolean(a)), Some(Kind::Boolean(b))) => a.cmp(b),
        (Some(Kind::Integer(a)), Some(Kind::Integer(b))) => a.cmp(b),
        (Some(Kind::Real(a)), Some(Kind::Real(b))) => a.total_cmp(b),
        (Some(Kind::Integer(a)), Some(Kind::Real(b))) => (*a as f64).total_cmp(b),
        (Some(Kind::Real(a)), Some(Kind::Integer(b))) => a.total_cmp(&(*b as f64)),
        (Some(Kind::Text(a)), Some(Kind::Text(b))) => a.cmp(b),
        (Some(Kind::Blob(a)), Some(Kind::Blob(b))) => a.cmp(b),
        (Some(Kind::List(a)), Some(Kind::List(b))) => {
            for (x, y) in a.values.iter().zip(b.values.iter()) {
                let ordering = compare_values(x, y);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.values.len().cmp(&b.values.len())
        }
        (a, b) => kind_rank(a).cmp(&kind_rank(b)),
    }
}

/// Compare two rows by a sort key list. Column indexes start from 1;
/// a missing column compares as null.
pub fn compare_rows(left: &Row, right: &Row, order_bys: &[OrderBy]) -> Ordering {
    let nil = null();
    for order_by in order_bys {
        let index = order_by.index.max(1) as usize - 1;
        let a = left.columns.get(index).unwrap_or(&nil);
        let b = right.columns.get(index).unwrap_or(&nil);
        let ordering = compare_values(a, b);
        if ordering == Ordering::Equal {
            continue;
        }
        return if order_by.order() == Order::Descending {
            ordering.reverse()
        } else {
            ordering
        };
    }
    Ordering::Equal
}

/// Extract the key columns of a row. Indexes start from 1.
pub fn key_of(row: &Row, indexes: &[i32]) -> Row {
    let columns = indexes
        .iter()
        .map(|i| {
            let index = (*i).max(1) as usize - 1;
            row.columns.get(index).cloned().unwrap_or_else(null)
        })
        .collect();
    Row { columns }
}

/// The non-key columns of a row, in their original order.
pub fn rest_of(row: &Row, indexes: &[i32]) -> Vec<Value> {
    row.columns
        .iter()
        .enumerate()
        .filter(|(i, _)| !indexes.iter().any(|x| (*x).max(1) as usize - 1 == *i))
        .map(|(_, v)| v.clone())
        .collect()
}

/// Map a key row onto one of `count` partitions. The hash is stable
/// across processes so that peers agree on shard placement.
pub fn partition_of(key: &Row, count: usize) -> ExecutionResult<usize> {
    if count == 0 {
        return Err(ExecutionError::InvalidArgument(
            "cannot partition to zero outputs".to_string(),
        ));
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&key.encode_to_vec());
    Ok(hasher.finalize() as usize % count)
}

fn value_to_text(value: &Value) -> String {
    match &value.kind {
        None => String::new(),
        Some(Kind::Boolean(x)) => x.to_string(),
        Some(Kind::Integer(x)) => x.to_string(),
        Some(Kind::Real(x)) => x.to_string(),
        Some(Kind::Text(x)) => x.clone(),
        Some(Kind::Blob(x)) => String::from_utf8_lossy(x).into_owned(),
        Some(Kind::List(x)) => x
            .values
            .iter()
            .map(value_to_text)
            .collect::<Vec<_>>()
            .join(","),
    }
}

/// Render a row as one tab-separated text line for line-oriented
/// subprocesses.
pub fn row_to_line(row: &Row) -> String {
    row.columns
        .iter()
        .map(value_to_text)
        .collect::<Vec<_>>()
        .join("\t")
}

/// The text of one positional substitution argument. Indexes start from 1.
pub fn column_text(row: &Row, index: usize) -> Option<String> {
    row.columns.get(index.checked_sub(1)?).map(value_to_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_by(index: i32, order: Order) -> OrderBy {
        OrderBy {
            index,
            order: order as i32,
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let original = row(vec![integer(42), text("answer"), null()]);
        let decoded = decode_row(&encode_row(&original)).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_numeric_cross_comparison() {
        assert_eq!(compare_values(&integer(2), &real(2.5)), Ordering::Less);
        assert_eq!(compare_values(&real(3.0), &integer(2)), Ordering::Greater);
        assert_eq!(compare_values(&null(), &integer(0)), Ordering::Less);
    }

    #[test]
    fn test_compare_rows_descending() {
        let a = row(vec![integer(1), text("x")]);
        let b = row(vec![integer(2), text("x")]);
        let keys = vec![order_by(1, Order::Descending)];
        assert_eq!(compare_rows(&a, &b, &keys), Ordering::Greater);
    }

    #[test]
    fn test_key_and_rest() {
        let r = row(vec![text("k"), integer(1), integer(2)]);
        assert_eq!(key_of(&r, &[1]).columns, vec![text("k")]);
        assert_eq!(rest_of(&r, &[1]), vec![integer(1), integer(2)]);
    }

    #[test]
    fn test_partition_is_stable() {
        let key = row(vec![text("user-17")]);
        let a = partition_of(&key, 4).unwrap();
        let b = partition_of(&key, 4).unwrap();
        assert_eq!(a, b);
        assert!(a < 4);
    }

    #[test]
    fn test_row_to_line() {
        let r = row(vec![text("a"), integer(7)]);
        assert_eq!(row_to_line(&r), "a\t7");
    }
}
