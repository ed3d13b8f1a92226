//! Ingestion, reprocessing and the link/edit operations, each serialized per
//! card and committed as one SQL transaction.

use chrono::{DateTime, Utc};
use serde::Serialize;
use spendy_core::transaction::validate_currency;
use spendy_core::{
    Card, CardId, NewCard, ParseStatus, ParsedFields, Settings, SourceContext, SourceEvent,
    SourceEventId, SourceType, Transaction, TransactionDraft, TransactionEdit, TransactionId,
    TransactionSourceLink,
};
use spendy_import::{
    AutoMatchEngine, Canonicalizer, MatchCandidate, MatchDecision, ParseFailure, ParseOutcome,
    Parser,
};
use spendy_intake::{
    sha256_hex, FileIntake, FileStore, LocalFileStore, TextExtractor, Utf8TextExtractor,
};
use spendy_storage::{
    begin_write, cards, source_events, transactions, CurrencyTotals, DbPool, NewSourceEvent,
    ParseUpdate, SourceEventFilter, TransactionFilter, TransactionPage, TransactionWrite,
};
use sqlx::SqliteConnection;
use std::path::Path;

use crate::canonicalize::{identity, Resolver};
use crate::error::ServiceError;
use crate::fx;
use crate::links;
use crate::locks::CardLocks;

type Intake = FileIntake<Box<dyn FileStore>, Box<dyn TextExtractor>>;

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub source_event: SourceEvent,
    /// The payload had been ingested before; nothing new was written.
    pub duplicate: bool,
    /// `None` when the event could not be matched (unparsed, no card).
    pub decision: Option<MatchDecision>,
    /// The transaction the event now belongs to, if any.
    pub transaction: Option<Transaction>,
}

impl IngestOutcome {
    fn duplicate(source_event: SourceEvent) -> Self {
        Self {
            source_event,
            duplicate: true,
            decision: None,
            transaction: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReprocessOutcome {
    pub source_event: SourceEvent,
    /// Set only when the event was unlinked and went through matching again.
    pub decision: Option<MatchDecision>,
    /// Transactions recomputed or created by this reprocess.
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionSource {
    #[serde(flatten)]
    pub link: TransactionSourceLink,
    pub source_event: SourceEvent,
}

pub struct Reconciler {
    pool: DbPool,
    parser: Parser,
    engine: AutoMatchEngine,
    resolver: Resolver,
    intake: Intake,
    locks: CardLocks,
}

impl Reconciler {
    /// Opens (and migrates) the database named in `settings`.
    pub async fn open(settings: &Settings) -> Result<Self, ServiceError> {
        let pool = spendy_storage::create_db(
            &settings.database.path,
            settings.database.max_connections,
        )
        .await?;
        Self::new(pool, settings)
    }

    pub fn new(pool: DbPool, settings: &Settings) -> Result<Self, ServiceError> {
        let fx = fx::from_settings(&settings.fx)?;
        Ok(Self {
            pool,
            parser: Parser::new(),
            engine: AutoMatchEngine::from_settings(&settings.matching),
            resolver: Resolver::new(Canonicalizer::new(settings.canonical.priority.clone()), fx),
            intake: FileIntake::new(
                Box::new(LocalFileStore::new(&settings.storage.uploads_dir)) as Box<dyn FileStore>,
                Box::new(Utf8TextExtractor) as Box<dyn TextExtractor>,
            ),
            locks: CardLocks::new(),
        })
    }

    /// Swaps the file store and text extractor (OCR, PDF engines).
    pub fn with_intake(
        mut self,
        store: impl FileStore + 'static,
        extractor: impl TextExtractor + 'static,
    ) -> Self {
        self.intake = FileIntake::new(
            Box::new(store) as Box<dyn FileStore>,
            Box::new(extractor) as Box<dyn TextExtractor>,
        );
        self
    }

    // ── Cards ─────────────────────────────────────────────────────────────────

    pub async fn add_card(&self, card: NewCard) -> Result<Card, ServiceError> {
        if let Some(currency) = &card.currency {
            validate_currency(currency)?;
        }
        let mut conn = self.pool.acquire().await?;
        let card = cards::insert_card(&mut conn, &card, Utc::now()).await?;
        tracing::info!(card_id = %card.id, "card registered");
        Ok(card)
    }

    pub async fn list_cards(&self) -> Result<Vec<Card>, ServiceError> {
        let mut conn = self.pool.acquire().await?;
        Ok(cards::list_cards(&mut conn).await?)
    }

    // ── Ingestion ─────────────────────────────────────────────────────────────

    pub async fn ingest_text(
        &self,
        source_type: SourceType,
        raw_text: &str,
        context: SourceContext,
    ) -> Result<IngestOutcome, ServiceError> {
        let raw_hash = sha256_hex(raw_text.as_bytes());
        if let Some(existing) = self.find_by_hash(&raw_hash).await? {
            tracing::info!(source_event_id = %existing.id, hash = %raw_hash, "duplicate payload");
            return Ok(IngestOutcome::duplicate(existing));
        }
        let outcome = self.parser.parse(source_type, raw_text);
        let payload = Payload {
            source_type,
            raw_text: Some(raw_text.to_string()),
            file_path: None,
            raw_hash,
        };
        self.record(payload, outcome, context).await
    }

    /// Stores the file, extracts its text and ingests that. A file whose text
    /// cannot be extracted is still recorded, as a failed event.
    pub async fn ingest_file(
        &self,
        source_type: SourceType,
        bytes: &[u8],
        extension: &str,
        context: SourceContext,
    ) -> Result<IngestOutcome, ServiceError> {
        let raw_hash = sha256_hex(bytes);
        if let Some(existing) = self.find_by_hash(&raw_hash).await? {
            tracing::info!(source_event_id = %existing.id, hash = %raw_hash, "duplicate file");
            return Ok(IngestOutcome::duplicate(existing));
        }
        let stored = self.intake.process_bytes(bytes, extension).await?;
        let (raw_text, outcome) = match stored.text {
            Ok(text) => {
                let outcome = self.parser.parse(source_type, &text);
                (Some(text), outcome)
            }
            Err(e) => (None, extraction_failed(&e)),
        };
        let payload = Payload {
            source_type,
            raw_text,
            file_path: Some(stored.stored_path.to_string_lossy().into_owned()),
            raw_hash,
        };
        self.record(payload, outcome, context).await
    }

    async fn find_by_hash(&self, raw_hash: &str) -> Result<Option<SourceEvent>, ServiceError> {
        let mut conn = self.pool.acquire().await?;
        Ok(source_events::find_source_event_by_hash(&mut conn, raw_hash).await?)
    }

    async fn record(
        &self,
        payload: Payload,
        outcome: ParseOutcome,
        context: SourceContext,
    ) -> Result<IngestOutcome, ServiceError> {
        let now = Utc::now();
        let (mut parsed, parse_status, parse_error) = split_outcome(outcome);
        if let Some(reason) = &parse_error {
            tracing::warn!(hash = %payload.raw_hash, status = %parse_status, "payload not parsed: {reason}");
        }

        let card = self
            .resolve_card(context.card_id, context.account_id, &parsed)
            .await?;
        fill_currency(&mut parsed, card.as_ref());

        let new_event = NewSourceEvent {
            source_type: payload.source_type,
            raw_text: payload.raw_text,
            file_path: payload.file_path,
            raw_hash: payload.raw_hash,
            parsed,
            account_id: context.account_id,
            card_id: card.as_ref().map(|c| c.id),
            sender: context.sender,
            recipients: context.recipients,
            received_at: context.received_at.unwrap_or(now),
            parse_status,
            parse_error,
            created_at: now,
            parsed_at: Some(now),
        };

        let _guard = self.locks.lock_opt(new_event.card_id).await;
        let mut tx = begin_write(&self.pool).await?;
        let id = match source_events::insert_source_event(&mut tx, &new_event).await {
            Ok(id) => id,
            Err(e) if e.is_unique_violation() => {
                tx.rollback().await?;
                let existing = self
                    .find_by_hash(&new_event.raw_hash)
                    .await?
                    .ok_or(ServiceError::Storage(e))?;
                tracing::info!(source_event_id = %existing.id, "lost ingest race; returning existing event");
                return Ok(IngestOutcome::duplicate(existing));
            }
            Err(e) => return Err(e.into()),
        };
        let event = source_events::get_source_event(&mut tx, id)
            .await?
            .ok_or(ServiceError::SourceEventNotFound(id))?;
        tracing::info!(
            source_event_id = %id,
            source_type = %event.source_type,
            status = %event.parse_status,
            card_id = ?event.card_id,
            "source event recorded"
        );

        let (decision, transaction) = match &card {
            Some(card) if event.is_parsed() => self.match_and_apply(&mut tx, &event, card, now).await?,
            _ => (None, None),
        };
        tx.commit().await?;

        Ok(IngestOutcome {
            source_event: event,
            duplicate: false,
            decision,
            transaction,
        })
    }

    /// Card given by the caller, else the unique card whose last four digits
    /// the payload mentions.
    async fn resolve_card(
        &self,
        card_id: Option<CardId>,
        account_id: Option<i64>,
        parsed: &ParsedFields,
    ) -> Result<Option<Card>, ServiceError> {
        let mut conn = self.pool.acquire().await?;
        if let Some(id) = card_id {
            return cards::get_card(&mut conn, id)
                .await?
                .map(Some)
                .ok_or(ServiceError::CardNotFound(id));
        }
        match parsed.card_last4.as_deref() {
            Some(last4) => Ok(cards::find_card_by_last_four(&mut conn, account_id, last4).await?),
            None => Ok(None),
        }
    }

    /// Candidate query, scoring and the resulting link or creation, all on
    /// the caller's SQL transaction.
    async fn match_and_apply(
        &self,
        conn: &mut SqliteConnection,
        event: &SourceEvent,
        card: &Card,
        now: DateTime<Utc>,
    ) -> Result<(Option<MatchDecision>, Option<Transaction>), ServiceError> {
        let Some(incoming) = self.resolver.matchable(event, card).await else {
            return Ok((None, None));
        };
        let candidates: Vec<MatchCandidate> =
            transactions::find_candidates(conn, card.id, incoming.amount, &incoming.currency)
                .await?
                .into_iter()
                .map(match_candidate)
                .collect();
        let ranked = self.engine.find_matches(&incoming, &candidates);
        for m in &ranked {
            tracing::debug!(
                source_event_id = %event.id,
                transaction_id = %m.transaction_id,
                confidence = m.confidence,
                match_type = ?m.match_type,
                "scored candidate"
            );
        }
        let decision = self.engine.decide(&ranked);

        let transaction = match &decision {
            MatchDecision::NewTransaction => {
                let draft = TransactionDraft {
                    card_id: Some(card.id),
                    ..Default::default()
                };
                Some(links::create_and_link(conn, &self.resolver, &draft, event.id, now).await?)
            }
            MatchDecision::LinkTo {
                transaction_id,
                confidence,
            } => Some(
                links::link(
                    conn,
                    &self.resolver,
                    *transaction_id,
                    event.id,
                    Some(*confidence),
                    false,
                    now,
                )
                .await?,
            ),
            MatchDecision::Ambiguous { candidates } => {
                tracing::info!(
                    source_event_id = %event.id,
                    candidates = candidates.len(),
                    "ambiguous match; left pending for review"
                );
                None
            }
        };
        Ok((Some(decision), transaction))
    }

    // ── Reprocess ─────────────────────────────────────────────────────────────

    /// Parses the stored payload again. Linked events keep their links and
    /// only refresh the transactions they feed; unlinked ones are matched
    /// again.
    pub async fn reprocess(&self, id: SourceEventId) -> Result<ReprocessOutcome, ServiceError> {
        let event = {
            let mut conn = self.pool.acquire().await?;
            source_events::get_source_event(&mut conn, id)
                .await?
                .ok_or(ServiceError::SourceEventNotFound(id))?
        };

        let outcome = match (&event.file_path, &event.raw_text) {
            (Some(path), _) => match self.intake.reextract(Path::new(path)).await {
                Ok(text) => self.parser.parse(event.source_type, &text),
                Err(e) => extraction_failed(&e.to_string()),
            },
            (None, Some(text)) => self.parser.parse(event.source_type, text),
            (None, None) => ParseOutcome::Failed(ParseFailure::new("Source event has no payload")),
        };
        let (mut parsed, parse_status, parse_error) = split_outcome(outcome);
        let card = self
            .resolve_card(event.card_id, event.account_id, &parsed)
            .await?;
        fill_currency(&mut parsed, card.as_ref());

        let now = Utc::now();
        let update = ParseUpdate {
            parsed,
            card_id: card.as_ref().map(|c| c.id),
            parse_status,
            parse_error,
            parsed_at: now,
        };

        let _guard = self.locks.lock_opt(update.card_id).await;
        let mut tx = begin_write(&self.pool).await?;
        if !source_events::update_parse_result(&mut tx, id, event.reprocess_version, &update).await? {
            tx.rollback().await?;
            return Err(ServiceError::ConcurrentReprocess(id));
        }
        let refreshed = source_events::get_source_event(&mut tx, id)
            .await?
            .ok_or(ServiceError::SourceEventNotFound(id))?;
        tracing::info!(
            source_event_id = %id,
            version = refreshed.reprocess_version,
            status = %refreshed.parse_status,
            "source event reprocessed"
        );

        let linked = source_events::linked_transaction_ids(&mut tx, id).await?;
        let mut decision = None;
        let mut touched = Vec::new();
        if linked.is_empty() {
            if let Some(card) = card.as_ref().filter(|_| refreshed.is_parsed()) {
                let (d, t) = self.match_and_apply(&mut tx, &refreshed, card, now).await?;
                decision = d;
                touched.extend(t);
            }
        } else {
            for transaction_id in linked {
                touched.push(self.resolver.recompute(&mut tx, transaction_id, now).await?);
            }
        }
        tx.commit().await?;

        Ok(ReprocessOutcome {
            source_event: refreshed,
            decision,
            transactions: touched,
        })
    }

    // ── Link management ───────────────────────────────────────────────────────

    async fn card_of(&self, transaction_id: TransactionId) -> Result<CardId, ServiceError> {
        let mut conn = self.pool.acquire().await?;
        transactions::get_transaction(&mut conn, transaction_id)
            .await?
            .map(|t| t.card_id)
            .ok_or(ServiceError::TransactionNotFound(transaction_id))
    }

    pub async fn link(
        &self,
        transaction_id: TransactionId,
        source_event_id: SourceEventId,
        confidence: Option<f64>,
        make_primary: bool,
    ) -> Result<Transaction, ServiceError> {
        let card_id = self.card_of(transaction_id).await?;
        let _guard = self.locks.lock(card_id).await;
        let mut tx = begin_write(&self.pool).await?;
        let transaction = links::link(
            &mut tx,
            &self.resolver,
            transaction_id,
            source_event_id,
            confidence,
            make_primary,
            Utc::now(),
        )
        .await?;
        tx.commit().await?;
        Ok(transaction)
    }

    pub async fn unlink(
        &self,
        transaction_id: TransactionId,
        source_event_id: SourceEventId,
    ) -> Result<Transaction, ServiceError> {
        let card_id = self.card_of(transaction_id).await?;
        let _guard = self.locks.lock(card_id).await;
        let mut tx = begin_write(&self.pool).await?;
        let transaction =
            links::unlink(&mut tx, &self.resolver, transaction_id, source_event_id, Utc::now())
                .await?;
        tx.commit().await?;
        Ok(transaction)
    }

    pub async fn set_primary(
        &self,
        transaction_id: TransactionId,
        source_event_id: SourceEventId,
    ) -> Result<Transaction, ServiceError> {
        let card_id = self.card_of(transaction_id).await?;
        let _guard = self.locks.lock(card_id).await;
        let mut tx = begin_write(&self.pool).await?;
        let transaction =
            links::set_primary(&mut tx, &self.resolver, transaction_id, source_event_id, Utc::now())
                .await?;
        tx.commit().await?;
        Ok(transaction)
    }

    pub async fn create_and_link(
        &self,
        draft: TransactionDraft,
        source_event_id: SourceEventId,
    ) -> Result<Transaction, ServiceError> {
        let card_id = match draft.card_id {
            Some(id) => Some(id),
            None => self.get_source_event(source_event_id).await?.card_id,
        };
        let _guard = self.locks.lock_opt(card_id).await;
        let mut tx = begin_write(&self.pool).await?;
        let transaction =
            links::create_and_link(&mut tx, &self.resolver, &draft, source_event_id, Utc::now())
                .await?;
        tx.commit().await?;
        Ok(transaction)
    }

    // ── Manual edits ──────────────────────────────────────────────────────────

    /// Overrides canonical fields by hand. Edited fields survive recompute
    /// until a source contributes something newer.
    pub async fn edit_transaction(
        &self,
        id: TransactionId,
        edit: TransactionEdit,
    ) -> Result<Transaction, ServiceError> {
        let card_id = self.card_of(id).await?;
        let _guard = self.locks.lock(card_id).await;
        let mut tx = begin_write(&self.pool).await?;
        let mut current = transactions::get_transaction(&mut tx, id)
            .await?
            .ok_or(ServiceError::TransactionNotFound(id))?;
        if edit.is_empty() {
            return Ok(current);
        }

        let now = Utc::now();
        let touched = edit.apply(&mut current.canonical);
        current.canonical.validate()?;
        current.edited_fields.extend(touched);
        let derived = identity(current.card_id, &current.canonical);
        let write = TransactionWrite {
            card_id: current.card_id,
            canonical: &current.canonical,
            fx_fee: edit.fx_fee.or(current.fx_fee),
            merchant_norm: &derived.merchant_norm,
            fingerprint: &derived.fingerprint,
            fingerprint_debug: &derived.fingerprint_debug,
            edited_fields: &current.edited_fields,
            edited_at: Some(now),
        };
        transactions::update_transaction(&mut tx, id, &write, now).await?;
        let transaction = self.resolver.recompute(&mut tx, id, now).await?;
        tx.commit().await?;
        tracing::info!(transaction_id = %id, fields = ?transaction.edited_fields, "transaction edited");
        Ok(transaction)
    }

    /// Deletes the transaction and its links; the source events stay.
    pub async fn delete_transaction(&self, id: TransactionId) -> Result<(), ServiceError> {
        let card_id = self.card_of(id).await?;
        let _guard = self.locks.lock(card_id).await;
        let mut tx = begin_write(&self.pool).await?;
        if !transactions::delete_transaction(&mut tx, id).await? {
            return Err(ServiceError::TransactionNotFound(id));
        }
        tx.commit().await?;
        tracing::info!(transaction_id = %id, "transaction deleted");
        Ok(())
    }

    // ── Read side ─────────────────────────────────────────────────────────────

    pub async fn get_transaction(&self, id: TransactionId) -> Result<Transaction, ServiceError> {
        let mut conn = self.pool.acquire().await?;
        transactions::get_transaction(&mut conn, id)
            .await?
            .ok_or(ServiceError::TransactionNotFound(id))
    }

    pub async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<TransactionPage, ServiceError> {
        let mut conn = self.pool.acquire().await?;
        Ok(transactions::list_transactions(&mut conn, filter).await?)
    }

    pub async fn transaction_summary(
        &self,
        filter: &TransactionFilter,
    ) -> Result<Vec<CurrencyTotals>, ServiceError> {
        let mut conn = self.pool.acquire().await?;
        Ok(transactions::transaction_summary(&mut conn, filter).await?)
    }

    /// Linked events with link metadata, primary first then by confidence.
    pub async fn transaction_sources(
        &self,
        id: TransactionId,
    ) -> Result<Vec<TransactionSource>, ServiceError> {
        let mut conn = self.pool.acquire().await?;
        if transactions::get_transaction(&mut conn, id).await?.is_none() {
            return Err(ServiceError::TransactionNotFound(id));
        }
        Ok(spendy_storage::linked_sources(&mut conn, id)
            .await?
            .into_iter()
            .map(|l| TransactionSource {
                link: l.link,
                source_event: l.source_event,
            })
            .collect())
    }

    pub async fn get_source_event(&self, id: SourceEventId) -> Result<SourceEvent, ServiceError> {
        let mut conn = self.pool.acquire().await?;
        source_events::get_source_event(&mut conn, id)
            .await?
            .ok_or(ServiceError::SourceEventNotFound(id))
    }

    pub async fn list_source_events(
        &self,
        filter: &SourceEventFilter,
    ) -> Result<Vec<SourceEvent>, ServiceError> {
        let mut conn = self.pool.acquire().await?;
        Ok(source_events::list_source_events(&mut conn, filter).await?)
    }
}

struct Payload {
    source_type: SourceType,
    raw_text: Option<String>,
    file_path: Option<String>,
    raw_hash: String,
}

fn split_outcome(outcome: ParseOutcome) -> (ParsedFields, ParseStatus, Option<String>) {
    match outcome {
        ParseOutcome::Parsed(fields) => (fields, ParseStatus::Parsed, None),
        ParseOutcome::Skipped { reason } => (ParsedFields::default(), ParseStatus::Skipped, Some(reason)),
        ParseOutcome::Failed(failure) => (failure.partial, ParseStatus::Failed, Some(failure.reason)),
    }
}

fn extraction_failed(message: &str) -> ParseOutcome {
    ParseOutcome::Failed(ParseFailure::new(format!("Text extraction failed: {message}")))
}

/// Statement rows often omit the currency; the card's currency stands in.
fn fill_currency(parsed: &mut ParsedFields, card: Option<&Card>) {
    if parsed.amount.is_some() && parsed.currency.is_none() {
        parsed.currency = card.and_then(|c| c.currency.clone());
    }
}

fn match_candidate(t: Transaction) -> MatchCandidate {
    MatchCandidate {
        transaction_id: t.id,
        card_id: t.card_id,
        amount: t.canonical.amount,
        currency: t.canonical.currency,
        datetimes: t
            .canonical
            .transaction_datetime
            .into_iter()
            .chain(t.canonical.posting_datetime)
            .collect(),
        merchant_norm: t.merchant_norm,
        fingerprint: t.fingerprint,
        created_at: t.created_at,
    }
}
