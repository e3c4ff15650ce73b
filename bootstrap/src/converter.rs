use chrono::Utc;
use tracing::{info, warn};

use buffer::ChangeSink;
use common::change::{Change, DdlEvent, DmlEvent, DmlKind};
use common::err::{KResult, KashoError};
use common::position::{bootstrap_position, BOOTSTRAP_SCORE_OFFSET};

use crate::DumpEvent;

/// Strictly monotonic generator of synthetic bootstrap positions,
/// starting at sequence 1. The bootstrap band holds exactly
/// `BOOTSTRAP_SCORE_OFFSET` sequences; the one after that would score
/// the same as the smallest live position, so the generator refuses it
/// and the bootstrap job fails loudly instead of corrupting replay
/// order.
pub struct BootstrapPositionGen {
    next: u64,
}

impl Default for BootstrapPositionGen {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapPositionGen {
    pub fn new() -> Self {
        BootstrapPositionGen { next: 1 }
    }

    pub fn next_position(&mut self) -> KResult<String> {
        if self.next > BOOTSTRAP_SCORE_OFFSET as u64 {
            return Err(KashoError::Parse(format!(
                "dump exceeds the bootstrap band of {} changes; \
                 split the dump or raise the band",
                BOOTSTRAP_SCORE_OFFSET
            )));
        }
        let pos = bootstrap_position(self.next);
        self.next += 1;
        Ok(pos)
    }

    pub fn emitted(&self) -> u64 {
        self.next - 1
    }
}

/// Range and count of what a conversion run wrote; on failure the range
/// tells the operator what to delete before retrying.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversionReport {
    pub changes: u64,
    pub first_position: Option<String>,
    pub last_position: Option<String>,
}

/// Drives a dump parser into a change sink. Every parsed statement
/// becomes one change on the next bootstrap position, so a whole dump
/// occupies the contiguous prefix `[1..N]` of the bootstrap band.
pub struct BootstrapConverter<'a, S: ChangeSink> {
    sink: &'a mut S,
    gen: BootstrapPositionGen,
    database: String,
    report: ConversionReport,
}

impl<'a, S: ChangeSink> BootstrapConverter<'a, S> {
    pub fn new(sink: &'a mut S, database: impl Into<String>) -> Self {
        BootstrapConverter {
            sink,
            gen: BootstrapPositionGen::new(),
            database: database.into(),
            report: ConversionReport::default(),
        }
    }

    /// Consume a parser to exhaustion. On error the partial report stays
    /// readable through [`report`](Self::report).
    pub async fn run<I>(&mut self, parser: I) -> KResult<ConversionReport>
    where
        I: Iterator<Item = KResult<DumpEvent>>,
    {
        for event in parser {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!(
                        written = self.report.changes,
                        first = ?self.report.first_position,
                        last = ?self.report.last_position,
                        "bootstrap conversion failed; delete the reported range and retry"
                    );
                    return Err(e);
                }
            };
            self.convert(event).await?;
        }
        info!(
            changes = self.report.changes,
            last = ?self.report.last_position,
            "bootstrap conversion complete"
        );
        Ok(self.report.clone())
    }

    pub fn report(&self) -> &ConversionReport {
        &self.report
    }

    async fn convert(&mut self, event: DumpEvent) -> KResult<()> {
        let position = match self.gen.next_position() {
            Ok(position) => position,
            Err(e) => {
                warn!(
                    written = self.report.changes,
                    first = ?self.report.first_position,
                    last = ?self.report.last_position,
                    "bootstrap band exhausted; delete the reported range before retrying"
                );
                return Err(e);
            }
        };
        let change = match event {
            DumpEvent::Ddl { sql, .. } => Change::ddl(
                position.clone(),
                DdlEvent {
                    id: self.gen.emitted() as i64,
                    time: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                    username: "bootstrap".to_string(),
                    database: self.database.clone(),
                    ddl: sql,
                },
            ),
            DumpEvent::Row {
                table,
                columns,
                values,
            } => Change::dml(
                position.clone(),
                DmlEvent {
                    table,
                    columnnames: columns,
                    columnvalues: values,
                    kind: DmlKind::Insert,
                    oldkeys: None,
                },
            ),
        };
        self.sink.publish(&change).await?;
        self.report.changes += 1;
        if self.report.first_position.is_none() {
            self.report.first_position = Some(position.clone());
        }
        self.report.last_position = Some(position);
        Ok(())
    }
}
