pub mod row;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::process::Stdio;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::debug;
use prost::Message;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::{ExecutionError, ExecutionResult};
use crate::pipe::{PipeReader, PipeWriter};
use crate::plan::{OrderBy, Row, Value};
use self::row::{
    column_text, compare_rows, compare_values, decode_row, encode_row, key_of, list, null,
    partition_of, rest_of, row_to_line, text,
};

/// Spawn a subprocess and stream bytes through its stdin and stdout.
/// In pipe mode the subprocess exchanges plain text lines: input rows are
/// rendered as tab-separated lines and each output line becomes a
/// single-text-column row. Otherwise rows pass through as
/// length-delimited frames.
pub async fn script(
    input: PipeReader,
    output: PipeWriter,
    path: String,
    args: Vec<String>,
    is_pipe: bool,
) -> ExecutionResult<()> {
    let mut child = Command::new(&path)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| ExecutionError::InternalError("missing subprocess stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecutionError::InternalError("missing subprocess stdout".to_string()))?;

    let feeder = tokio::spawn(feed_subprocess(input, stdin, is_pipe));
    let collector = tokio::spawn(collect_subprocess(stdout, output, is_pipe));

    // Feeding may fail once a subprocess such as `head` stops reading;
    // the exit status decides whether the operator failed.
    if let Err(e) = feeder.await? {
        debug!("stopped feeding subprocess {path}: {e}");
    }
    collector.await??;
    let status = child.wait().await?;
    if status.success() {
        Ok(())
    } else {
        Err(ExecutionError::InternalError(format!(
            "script {path} exited with {status}"
        )))
    }
}

async fn feed_subprocess(
    mut input: PipeReader,
    mut stdin: ChildStdin,
    is_pipe: bool,
) -> ExecutionResult<()> {
    if is_pipe {
        while let Some(frame) = input.read().await {
            let row = decode_row(&frame)?;
            stdin.write_all(row_to_line(&row).as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }
        stdin.flush().await?;
    } else {
        let mut sink = FramedWrite::new(stdin, LengthDelimitedCodec::new());
        while let Some(frame) = input.read().await {
            sink.send(frame).await?;
        }
        sink.flush().await?;
    }
    Ok(())
}

async fn collect_subprocess(
    stdout: ChildStdout,
    output: PipeWriter,
    is_pipe: bool,
) -> ExecutionResult<()> {
    if is_pipe {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            output.write(encode_row(&row::row(vec![text(line)]))).await?;
        }
    } else {
        let mut frames = FramedRead::new(stdout, LengthDelimitedCodec::new());
        while let Some(frame) = frames.next().await {
            output.write(frame?.freeze()).await?;
        }
    }
    Ok(())
}

/// Sort all input rows by the given key list.
pub async fn local_sort(
    mut input: PipeReader,
    output: PipeWriter,
    order_bys: Vec<OrderBy>,
) -> ExecutionResult<()> {
    let mut rows = Vec::new();
    while let Some(frame) = input.read().await {
        rows.push(decode_row(&frame)?);
    }
    rows.sort_by(|a, b| compare_rows(a, b, &order_bys));
    for row in &rows {
        output.write(encode_row(row)).await?;
    }
    Ok(())
}

/// For each input row, substitute its column values into the command
/// template (`$1`, `$2`, ...) and stream the command's output lines.
pub async fn pipe_as_args(
    mut input: PipeReader,
    output: PipeWriter,
    code: String,
) -> ExecutionResult<()> {
    while let Some(frame) = input.read().await {
        let row = decode_row(&frame)?;
        let mut command = code.clone();
        // Substitute from the highest index down so that `$12` is not
        // clobbered by `$1`.
        for index in (1..=row.columns.len()).rev() {
            if let Some(value) = column_text(&row, index) {
                command = command.replace(&format!("${index}"), &value);
            }
        }
        let out = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stderr(Stdio::inherit())
            .output()
            .await?;
        if !out.status.success() {
            return Err(ExecutionError::InternalError(format!(
                "command {command:?} exited with {}",
                out.status
            )));
        }
        for line in out.stdout.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let line = String::from_utf8_lossy(line).into_owned();
            output.write(encode_row(&row::row(vec![text(line)]))).await?;
        }
    }
    Ok(())
}

/// K-way merge of already-sorted input streams.
pub async fn merge_sorted_to(
    inputs: Vec<PipeReader>,
    output: PipeWriter,
    order_bys: Vec<OrderBy>,
) -> ExecutionResult<()> {
    let mut readers = inputs;
    let mut heads: Vec<Option<(Row, Bytes)>> = Vec::with_capacity(readers.len());
    for reader in readers.iter_mut() {
        heads.push(read_head(reader).await?);
    }
    loop {
        let mut winner: Option<usize> = None;
        for (index, head) in heads.iter().enumerate() {
            let Some((row, _)) = head else { continue };
            winner = match winner {
                Some(best) => {
                    let (best_row, _) = heads[best].as_ref().unwrap();
                    if compare_rows(row, best_row, &order_bys) == Ordering::Less {
                        Some(index)
                    } else {
                        Some(best)
                    }
                }
                None => Some(index),
            };
        }
        let Some(winner) = winner else { break };
        let (_, frame) = heads[winner].take().unwrap();
        output.write(frame).await?;
        heads[winner] = read_head(&mut readers[winner]).await?;
    }
    Ok(())
}

async fn read_head(reader: &mut PipeReader) -> ExecutionResult<Option<(Row, Bytes)>> {
    match reader.read().await {
        Some(frame) => Ok(Some((decode_row(&frame)?, frame))),
        None => Ok(None),
    }
}

/// Hash-partition input rows across the outputs by key columns.
pub async fn scatter_partitions(
    mut input: PipeReader,
    outputs: Vec<PipeWriter>,
    indexes: Vec<i32>,
) -> ExecutionResult<()> {
    while let Some(frame) = input.read().await {
        let row = decode_row(&frame)?;
        let key = key_of(&row, &indexes);
        let partition = partition_of(&key, outputs.len())?;
        outputs[partition].write(frame).await?;
    }
    Ok(())
}

/// Distribute rows across the outputs in rotation.
pub async fn round_robin(mut input: PipeReader, outputs: Vec<PipeWriter>) -> ExecutionResult<()> {
    if outputs.is_empty() {
        return Err(ExecutionError::InvalidArgument(
            "round robin requires at least one output".to_string(),
        ));
    }
    let mut index = 0;
    while let Some(frame) = input.read().await {
        outputs[index].write(frame).await?;
        index = (index + 1) % outputs.len();
    }
    Ok(())
}

/// Concatenate the input streams in order.
pub async fn collect_partitions(
    inputs: Vec<PipeReader>,
    output: PipeWriter,
) -> ExecutionResult<()> {
    for mut input in inputs {
        while let Some(frame) = input.read().await {
            output.write(frame).await?;
        }
    }
    Ok(())
}

/// Duplicate every input frame to all outputs.
pub async fn broadcast(mut input: PipeReader, outputs: Vec<PipeWriter>) -> ExecutionResult<()> {
    while let Some(frame) = input.read().await {
        for output in &outputs {
            output.write(frame.clone()).await?;
        }
    }
    Ok(())
}

/// Decode raw input bytes into rows according to the declared split
/// format. `line` emits one text column per line; `csv` splits each line
/// into text columns.
pub async fn input_split_reader(
    mut input: PipeReader,
    output: PipeWriter,
    input_type: String,
) -> ExecutionResult<()> {
    let csv = match input_type.as_str() {
        "line" | "lines" => false,
        "csv" => true,
        other => {
            return Err(ExecutionError::InvalidArgument(format!(
                "unknown input split type: {other}"
            )))
        }
    };
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(frame) = input.read().await {
        buffer.extend_from_slice(&frame);
        let mut start = 0;
        while let Some(offset) = buffer[start..].iter().position(|b| *b == b'\n') {
            let line = String::from_utf8_lossy(&buffer[start..start + offset]).into_owned();
            emit_split(&output, &line, csv).await?;
            start += offset + 1;
        }
        buffer.drain(..start);
    }
    if !buffer.is_empty() {
        let line = String::from_utf8_lossy(&buffer).into_owned();
        emit_split(&output, &line, csv).await?;
    }
    Ok(())
}

async fn emit_split(output: &PipeWriter, line: &str, csv: bool) -> ExecutionResult<()> {
    let row = if csv {
        row::row(parse_csv_line(line).into_iter().map(text).collect())
    } else {
        row::row(vec![text(line)])
    };
    output.write(encode_row(&row)).await
}

fn parse_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                chars.next();
                field.push('"');
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// Reads consecutive runs of rows sharing the same key from a sorted
/// stream.
struct GroupedReader {
    reader: PipeReader,
    indexes: Vec<i32>,
    pending: Option<Row>,
}

struct Group {
    key: Row,
    rows: Vec<Row>,
}

impl GroupedReader {
    fn new(reader: PipeReader, indexes: Vec<i32>) -> Self {
        Self {
            reader,
            indexes,
            pending: None,
        }
    }

    async fn next_group(&mut self) -> ExecutionResult<Option<Group>> {
        let first = match self.pending.take() {
            Some(row) => row,
            None => match self.reader.read().await {
                Some(frame) => decode_row(&frame)?,
                None => return Ok(None),
            },
        };
        let key = key_of(&first, &self.indexes);
        let mut rows = vec![first];
        while let Some(frame) = self.reader.read().await {
            let row = decode_row(&frame)?;
            if compare_keys(&key_of(&row, &self.indexes), &key) == Ordering::Equal {
                rows.push(row);
            } else {
                self.pending = Some(row);
                break;
            }
        }
        Ok(Some(Group { key, rows }))
    }
}

fn compare_keys(left: &Row, right: &Row) -> Ordering {
    for (a, b) in left.columns.iter().zip(right.columns.iter()) {
        let ordering = compare_values(a, b);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.columns.len().cmp(&right.columns.len())
}

fn nulls(count: usize) -> Vec<Value> {
    (0..count).map(|_| null()).collect()
}

fn joined_row(key: &Row, left: Vec<Value>, right: Vec<Value>) -> Row {
    let mut columns = key.columns.clone();
    columns.extend(left);
    columns.extend(right);
    Row { columns }
}

/// Sort-merge join over two key-partitioned, key-sorted streams.
/// Outer sides pad the missing half with nulls.
pub async fn join_partitioned_sorted(
    left: PipeReader,
    right: PipeReader,
    indexes: Vec<i32>,
    is_left_outer_join: bool,
    is_right_outer_join: bool,
    output: PipeWriter,
) -> ExecutionResult<()> {
    enum Side {
        Left,
        Right,
        Both,
    }

    let key_width = indexes.len();
    let mut left = GroupedReader::new(left, indexes.clone());
    let mut right = GroupedReader::new(right, indexes.clone());
    let mut left_group = left.next_group().await?;
    let mut right_group = right.next_group().await?;
    let mut left_width = 0;
    let mut right_width = 0;
    loop {
        if let Some(l) = &left_group {
            left_width = l.rows[0].columns.len().saturating_sub(key_width);
        }
        if let Some(r) = &right_group {
            right_width = r.rows[0].columns.len().saturating_sub(key_width);
        }
        let side = match (&left_group, &right_group) {
            (Some(l), Some(r)) => match compare_keys(&l.key, &r.key) {
                Ordering::Less => Side::Left,
                Ordering::Greater => Side::Right,
                Ordering::Equal => Side::Both,
            },
            (Some(_), None) => Side::Left,
            (None, Some(_)) => Side::Right,
            (None, None) => break,
        };
        match side {
            Side::Left => {
                if let (Some(l), true) = (&left_group, is_left_outer_join) {
                    for row in &l.rows {
                        output
                            .write(encode_row(&joined_row(
                                &l.key,
                                rest_of(row, &left.indexes),
                                nulls(right_width),
                            )))
                            .await?;
                    }
                }
                left_group = left.next_group().await?;
            }
            Side::Right => {
                if let (Some(r), true) = (&right_group, is_right_outer_join) {
                    for row in &r.rows {
                        output
                            .write(encode_row(&joined_row(
                                &r.key,
                                nulls(left_width),
                                rest_of(row, &right.indexes),
                            )))
                            .await?;
                    }
                }
                right_group = right.next_group().await?;
            }
            Side::Both => {
                if let (Some(l), Some(r)) = (&left_group, &right_group) {
                    for a in &l.rows {
                        for b in &r.rows {
                            output
                                .write(encode_row(&joined_row(
                                    &l.key,
                                    rest_of(a, &left.indexes),
                                    rest_of(b, &right.indexes),
                                )))
                                .await?;
                        }
                    }
                }
                left_group = left.next_group().await?;
                right_group = right.next_group().await?;
            }
        }
    }
    Ok(())
}

/// Sort-merge co-group: for every key on either side, emit one row of
/// the key columns followed by the list of left rows and the list of
/// right rows (each member row reduced to its non-key columns).
pub async fn co_group_partitioned_sorted(
    left: PipeReader,
    right: PipeReader,
    indexes: Vec<i32>,
    output: PipeWriter,
) -> ExecutionResult<()> {
    let mut left = GroupedReader::new(left, indexes.clone());
    let mut right = GroupedReader::new(right, indexes);
    let mut left_group = left.next_group().await?;
    let mut right_group = right.next_group().await?;
    loop {
        let (l, r) = match (&left_group, &right_group) {
            (Some(l), Some(r)) => match compare_keys(&l.key, &r.key) {
                Ordering::Less => (true, false),
                Ordering::Greater => (false, true),
                Ordering::Equal => (true, true),
            },
            (Some(_), None) => (true, false),
            (None, Some(_)) => (false, true),
            (None, None) => break,
        };
        let key = if l {
            left_group.as_ref().map(|g| g.key.clone())
        } else {
            right_group.as_ref().map(|g| g.key.clone())
        }
        .ok_or_else(|| ExecutionError::InternalError("co-group lost its key".to_string()))?;
        let left_rows = if l {
            group_as_list(left_group.as_ref(), &left.indexes)
        } else {
            list(vec![])
        };
        let right_rows = if r {
            group_as_list(right_group.as_ref(), &right.indexes)
        } else {
            list(vec![])
        };
        let mut columns = key.columns;
        columns.push(left_rows);
        columns.push(right_rows);
        output.write(encode_row(&Row { columns })).await?;
        if l {
            left_group = left.next_group().await?;
        }
        if r {
            right_group = right.next_group().await?;
        }
    }
    Ok(())
}

fn group_as_list(group: Option<&Group>, indexes: &[i32]) -> Value {
    let values = group
        .map(|g| {
            g.rows
                .iter()
                .map(|row| list(rest_of(row, indexes)))
                .collect()
        })
        .unwrap_or_default();
    list(values)
}

/// Top-N rows in the order of the key list.
pub async fn local_top(
    mut input: PipeReader,
    output: PipeWriter,
    n: usize,
    order_bys: Vec<OrderBy>,
) -> ExecutionResult<()> {
    let mut top: Vec<Row> = Vec::new();
    while let Some(frame) = input.read().await {
        let row = decode_row(&frame)?;
        let position = top
            .binary_search_by(|x| compare_rows(x, &row, &order_bys))
            .unwrap_or_else(|p| p);
        if position < n {
            top.insert(position, row);
            top.truncate(n);
        }
    }
    for row in &top {
        output.write(encode_row(row)).await?;
    }
    Ok(())
}

/// Build a hash table from the right side, then probe it with the left
/// side in stream order.
pub async fn local_hash_and_join_with(
    mut left: PipeReader,
    mut right: PipeReader,
    indexes: Vec<i32>,
    output: PipeWriter,
) -> ExecutionResult<()> {
    let mut table: HashMap<Vec<u8>, Vec<Row>> = HashMap::new();
    while let Some(frame) = right.read().await {
        let row = decode_row(&frame)?;
        let key = key_of(&row, &indexes).encode_to_vec();
        table.entry(key).or_default().push(row);
    }
    while let Some(frame) = left.read().await {
        let row = decode_row(&frame)?;
        let key = key_of(&row, &indexes);
        let Some(matches) = table.get(&key.encode_to_vec()) else {
            continue;
        };
        for matched in matches {
            output
                .write(encode_row(&joined_row(
                    &key,
                    rest_of(&row, &indexes),
                    rest_of(matched, &indexes),
                )))
                .await?;
        }
    }
    Ok(())
}
