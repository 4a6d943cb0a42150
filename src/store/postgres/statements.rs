/// Prepared SQL for one event log table.
///
/// The table name is interpolated once at build time; it must be a plain SQL
/// identifier.
#[derive(Clone, Debug)]
pub(super) struct Statements {
    table_name: String,
    by_aggregate: String,
    select_all: String,
    insert: String,
    current_sequence: String,
    advance_global: String,
    migrations: Vec<String>,
}

impl Statements {
    pub(super) fn new(table_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            by_aggregate: format!(
                "SELECT * FROM {0} \
                 WHERE aggregate_type = $1 AND aggregate_id = $2 AND sequence_number >= $3 \
                 ORDER BY sequence_number ASC",
                table_name
            ),
            select_all: format!(
                "SELECT * FROM {0} WHERE global_sequence >= $1 ORDER BY global_sequence ASC",
                table_name
            ),
            insert: format!(
                "INSERT INTO {0} \
                 (id, aggregate_type, aggregate_id, event_kind, schema_version, payload, \
                  sequence_number, global_sequence, recorded_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                table_name
            ),
            current_sequence: format!(
                "SELECT COALESCE(MAX(sequence_number), 0) FROM {0} \
                 WHERE aggregate_type = $1 AND aggregate_id = $2",
                table_name
            ),
            advance_global: format!(
                "UPDATE {0}_head SET last_global_sequence = last_global_sequence + $1 \
                 RETURNING last_global_sequence",
                table_name
            ),
            migrations: vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {0} \
                     ( \
                       id uuid NOT NULL, \
                       aggregate_type TEXT NOT NULL, \
                       aggregate_id TEXT NOT NULL, \
                       event_kind TEXT NOT NULL, \
                       schema_version INT NOT NULL DEFAULT 1, \
                       payload jsonb NOT NULL, \
                       sequence_number BIGINT NOT NULL, \
                       global_sequence BIGINT NOT NULL, \
                       recorded_at TIMESTAMPTZ NOT NULL DEFAULT current_timestamp, \
                       CONSTRAINT {0}_pkey PRIMARY KEY (id) \
                     )",
                    table_name
                ),
                format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS {0}_aggregate_sequence \
                     ON {0} (aggregate_type, aggregate_id, sequence_number)",
                    table_name
                ),
                format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS {0}_global_sequence \
                     ON {0} (global_sequence)",
                    table_name
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {0}_head \
                     ( \
                       onerow bool PRIMARY KEY DEFAULT true CHECK (onerow), \
                       last_global_sequence BIGINT NOT NULL \
                     )",
                    table_name
                ),
                format!(
                    "INSERT INTO {0}_head (onerow, last_global_sequence) VALUES (true, 0) \
                     ON CONFLICT DO NOTHING",
                    table_name
                ),
            ],
        }
    }

    pub(super) fn table_name(&self) -> &str {
        &self.table_name
    }

    pub(super) fn by_aggregate(&self) -> &str {
        &self.by_aggregate
    }

    pub(super) fn select_all(&self) -> &str {
        &self.select_all
    }

    pub(super) fn insert(&self) -> &str {
        &self.insert
    }

    pub(super) fn current_sequence(&self) -> &str {
        &self.current_sequence
    }

    pub(super) fn advance_global(&self) -> &str {
        &self.advance_global
    }

    pub(super) fn migrations(&self) -> &[String] {
        &self.migrations
    }
}
