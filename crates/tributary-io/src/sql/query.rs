//! Query text generation
//!
//! Identifiers are bracket-quoted and string literals escaped; cursor values
//! are integers, so every statement can be rendered as plain text.

use tributary_core::MERGE_KEY_FIELD;

pub const CHANGE_VERSION_COLUMN: &str = "SYS_CHANGE_VERSION";
pub const CHANGE_OPERATION_COLUMN: &str = "SYS_CHANGE_OPERATION";

/// Bracket-quote an identifier
pub fn quote_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Render a unicode string literal
pub fn quote_literal(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(table))
}

pub fn columns_query(schema: &str, table: &str) -> String {
    format!(
        "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE, NUMERIC_PRECISION, NUMERIC_SCALE \
         FROM INFORMATION_SCHEMA.COLUMNS \
         WHERE TABLE_SCHEMA = {} AND TABLE_NAME = {} \
         ORDER BY ORDINAL_POSITION",
        quote_literal(schema),
        quote_literal(table)
    )
}

pub fn primary_key_query(schema: &str, table: &str) -> String {
    format!(
        "SELECT kcu.COLUMN_NAME \
         FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS AS tc \
         JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE AS kcu \
           ON tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME AND tc.TABLE_SCHEMA = kcu.TABLE_SCHEMA \
         WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY' AND tc.TABLE_SCHEMA = {} AND tc.TABLE_NAME = {} \
         ORDER BY kcu.ORDINAL_POSITION",
        quote_literal(schema),
        quote_literal(table)
    )
}

/// Stable hash of the key columns joined with `#`
pub fn merge_key_expression(alias: &str, primary_keys: &[String]) -> String {
    let parts: Vec<String> = primary_keys
        .iter()
        .map(|k| format!("CAST({alias}.{} AS NVARCHAR(4000))", quote_identifier(k)))
        .collect();
    let joined = match parts.as_slice() {
        [single] => single.clone(),
        _ => format!("CONCAT_WS(N'#', {})", parts.join(", ")),
    };
    format!("CONVERT(VARCHAR(64), HASHBYTES('SHA2_256', {joined}), 2)")
}

fn select_list(alias: &str, columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("{alias}.{}", quote_identifier(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Full table read used by the simple source
pub fn table_query(schema: &str, table: &str, columns: &[String], primary_keys: &[String]) -> String {
    format!(
        "SELECT {}, {} AS {MERGE_KEY_FIELD} FROM {} AS t",
        select_list("t", columns),
        merge_key_expression("t", primary_keys),
        qualified_table(schema, table)
    )
}

/// Whole-table snapshot tagged with the current change tracking version
pub fn snapshot_query(schema: &str, table: &str, columns: &[String], primary_keys: &[String]) -> String {
    format!(
        "SELECT {}, CAST(CHANGE_TRACKING_CURRENT_VERSION() AS BIGINT) AS {CHANGE_VERSION_COLUMN}, \
         N'I' AS {CHANGE_OPERATION_COLUMN}, {} AS {MERGE_KEY_FIELD} FROM {} AS t",
        select_list("t", columns),
        merge_key_expression("t", primary_keys),
        qualified_table(schema, table)
    )
}

/// Smallest committed version strictly after the cursor, NULL when none
pub fn next_version_query(cursor: i64) -> String {
    format!("SELECT MIN(commit_ts) FROM sys.dm_tran_commit_table WHERE commit_ts > {cursor}")
}

/// Version to start from when incremental reads look back in time
pub fn look_back_version_query(look_back_secs: u64) -> String {
    format!(
        "SELECT COALESCE(MIN(commit_ts) - 1, CHANGE_TRACKING_CURRENT_VERSION()) \
         FROM sys.dm_tran_commit_table \
         WHERE commit_time >= DATEADD(SECOND, -{look_back_secs}, GETDATE())"
    )
}

/// Changes after `cursor` up to and including `until`
///
/// Key columns come from the change table so deleted rows keep their key.
pub fn changes_query(
    schema: &str,
    table: &str,
    columns: &[String],
    primary_keys: &[String],
    cursor: i64,
    until: i64,
) -> String {
    let select = columns
        .iter()
        .map(|c| {
            let alias = if primary_keys.contains(c) { "ct" } else { "t" };
            format!("{alias}.{}", quote_identifier(c))
        })
        .collect::<Vec<_>>()
        .join(", ");
    let join = primary_keys
        .iter()
        .map(|k| format!("t.{0} = ct.{0}", quote_identifier(k)))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "SELECT {select}, ct.{CHANGE_VERSION_COLUMN}, ct.{CHANGE_OPERATION_COLUMN}, {} AS {MERGE_KEY_FIELD} \
         FROM CHANGETABLE(CHANGES {}, {cursor}) AS ct \
         LEFT JOIN {} AS t ON {join} \
         WHERE ct.{CHANGE_VERSION_COLUMN} <= {until} \
         ORDER BY ct.{CHANGE_VERSION_COLUMN}",
        merge_key_expression("ct", primary_keys),
        qualified_table(schema, table),
        qualified_table(schema, table)
    )
}
