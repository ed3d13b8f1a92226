//! Subcommands. Every command prints its result as JSON on stdout.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde::Serialize;
use spendy::Reconciler;
use spendy_core::{
    CardId, Money, NewCard, ParseStatus, SourceContext, SourceEventId, SourceType,
    TransactionDraft, TransactionEdit, TransactionId, TransactionKind,
};
use spendy_storage::{Direction, SourceEventFilter, TransactionFilter};

#[derive(Subcommand)]
pub enum Command {
    /// Register and list cards
    Card {
        #[command(subcommand)]
        command: CardCommand,
    },

    /// Ingest a raw payload
    Ingest {
        #[command(subcommand)]
        command: IngestCommand,
    },

    /// Link a source event to a transaction
    Link {
        transaction_id: i64,
        source_event_id: i64,
        /// Match confidence in [0, 1]; omit for a manual link
        #[arg(long)]
        confidence: Option<f64>,
        /// Make this the primary source
        #[arg(long)]
        primary: bool,
    },

    /// Remove a link, promoting another source if it was primary
    Unlink {
        transaction_id: i64,
        source_event_id: i64,
    },

    /// Make a linked source the primary one
    SetPrimary {
        transaction_id: i64,
        source_event_id: i64,
    },

    /// Create a transaction from a source event and link it as primary
    CreateAndLink {
        source_event_id: i64,
        #[arg(long)]
        card_id: Option<i64>,
        #[command(flatten)]
        fields: FieldArgs,
    },

    /// Parse a stored source event again
    Reprocess { source_event_id: i64 },

    /// Query and correct transactions
    Transactions {
        #[command(subcommand)]
        command: TransactionCommand,
    },

    /// Inspect source events
    Events {
        #[command(subcommand)]
        command: EventCommand,
    },
}

#[derive(Subcommand)]
pub enum CardCommand {
    /// Register a card
    Add {
        /// Masked number, e.g. "XXXX XXXX XXXX 3278"
        masked_number: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        account_id: Option<i64>,
        /// Account currency (three letters)
        #[arg(long)]
        currency: Option<String>,
    },
    /// List cards
    List,
}

#[derive(Subcommand)]
pub enum IngestCommand {
    /// Ingest message text (reads stdin when no text is given)
    Text {
        source_type: SourceType,
        text: Option<String>,
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Ingest a file (statement export, screenshot)
    File {
        source_type: SourceType,
        path: PathBuf,
        #[command(flatten)]
        context: ContextArgs,
    },
}

#[derive(Args)]
pub struct ContextArgs {
    #[arg(long)]
    account_id: Option<i64>,
    #[arg(long)]
    card_id: Option<i64>,
    #[arg(long)]
    sender: Option<String>,
    #[arg(long)]
    recipients: Option<String>,
    /// When the message arrived (RFC 3339)
    #[arg(long)]
    received_at: Option<DateTime<Utc>>,
}

impl From<ContextArgs> for SourceContext {
    fn from(a: ContextArgs) -> Self {
        SourceContext {
            account_id: a.account_id,
            card_id: a.card_id.map(CardId),
            sender: a.sender,
            recipients: a.recipients,
            received_at: a.received_at,
        }
    }
}

/// Canonical field overrides shared by create-and-link and edit.
#[derive(Args)]
pub struct FieldArgs {
    /// Signed amount, negative for money out
    #[arg(long, allow_hyphen_values = true)]
    amount: Option<Money>,
    #[arg(long)]
    currency: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long)]
    kind: Option<TransactionKind>,
    #[arg(long)]
    transaction_datetime: Option<DateTime<Utc>>,
    #[arg(long)]
    posting_datetime: Option<DateTime<Utc>>,
    #[arg(long, allow_hyphen_values = true)]
    fx_fee: Option<Money>,
}

#[derive(Subcommand)]
pub enum TransactionCommand {
    /// List transactions, newest first
    List {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Money out and in per currency
    Summary {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Show one transaction
    Show { id: i64 },
    /// Linked source events, primary first
    Sources { id: i64 },
    /// Override canonical fields by hand
    Edit {
        id: i64,
        #[command(flatten)]
        fields: FieldArgs,
    },
    /// Delete a transaction and its links
    Delete { id: i64 },
}

#[derive(Args)]
pub struct FilterArgs {
    #[arg(long)]
    account_id: Option<i64>,
    #[arg(long)]
    card_id: Option<i64>,
    #[arg(long)]
    from: Option<DateTime<Utc>>,
    #[arg(long)]
    to: Option<DateTime<Utc>>,
    /// Free text matched against the description
    #[arg(long)]
    q: Option<String>,
    #[arg(long)]
    kind: Option<TransactionKind>,
    /// "in" or "out"
    #[arg(long)]
    direction: Option<Direction>,
    #[arg(long)]
    currency: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    min_amount: Option<Money>,
    #[arg(long, allow_hyphen_values = true)]
    max_amount: Option<Money>,
    #[arg(long, default_value_t = 100)]
    limit: i64,
    #[arg(long, default_value_t = 0)]
    offset: i64,
}

impl From<FilterArgs> for TransactionFilter {
    fn from(a: FilterArgs) -> Self {
        TransactionFilter {
            account_id: a.account_id,
            card_id: a.card_id.map(CardId),
            from: a.from,
            to: a.to,
            q: a.q,
            kind: a.kind,
            direction: a.direction,
            currency: a.currency,
            min_amount: a.min_amount,
            max_amount: a.max_amount,
            limit: Some(a.limit),
            offset: Some(a.offset),
        }
    }
}

#[derive(Subcommand)]
pub enum EventCommand {
    /// List source events, newest first
    List {
        #[arg(long)]
        source_type: Option<SourceType>,
        #[arg(long)]
        status: Option<ParseStatus>,
        /// Only events linked (true) or not linked (false) to a transaction
        #[arg(long)]
        linked: Option<bool>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Show one source event
    Show { id: i64 },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run(reconciler: &Reconciler, command: Command) -> Result<()> {
    match command {
        Command::Card { command } => run_card(reconciler, command).await,
        Command::Ingest { command } => run_ingest(reconciler, command).await,
        Command::Link {
            transaction_id,
            source_event_id,
            confidence,
            primary,
        } => {
            if confidence.is_some_and(|c| !(0.0..=1.0).contains(&c)) {
                bail!("confidence must be between 0 and 1");
            }
            let t = reconciler
                .link(
                    TransactionId(transaction_id),
                    SourceEventId(source_event_id),
                    confidence,
                    primary,
                )
                .await?;
            print_json(&t)
        }
        Command::Unlink {
            transaction_id,
            source_event_id,
        } => {
            let t = reconciler
                .unlink(TransactionId(transaction_id), SourceEventId(source_event_id))
                .await?;
            print_json(&t)
        }
        Command::SetPrimary {
            transaction_id,
            source_event_id,
        } => {
            let t = reconciler
                .set_primary(TransactionId(transaction_id), SourceEventId(source_event_id))
                .await?;
            print_json(&t)
        }
        Command::CreateAndLink {
            source_event_id,
            card_id,
            fields,
        } => {
            let draft = TransactionDraft {
                card_id: card_id.map(CardId),
                amount: fields.amount,
                currency: fields.currency,
                transaction_datetime: fields.transaction_datetime,
                posting_datetime: fields.posting_datetime,
                description: fields.description,
                location: fields.location,
                kind: fields.kind,
                fx_fee: fields.fx_fee,
                ..Default::default()
            };
            let t = reconciler
                .create_and_link(draft, SourceEventId(source_event_id))
                .await?;
            print_json(&t)
        }
        Command::Reprocess { source_event_id } => {
            let outcome = reconciler.reprocess(SourceEventId(source_event_id)).await?;
            print_json(&outcome)
        }
        Command::Transactions { command } => run_transactions(reconciler, command).await,
        Command::Events { command } => run_events(reconciler, command).await,
    }
}

async fn run_card(reconciler: &Reconciler, command: CardCommand) -> Result<()> {
    match command {
        CardCommand::Add {
            masked_number,
            name,
            account_id,
            currency,
        } => {
            let card = reconciler
                .add_card(NewCard {
                    account_id,
                    masked_number,
                    name,
                    currency: currency.map(|c| c.to_uppercase()),
                })
                .await?;
            print_json(&card)
        }
        CardCommand::List => print_json(&reconciler.list_cards().await?),
    }
}

async fn run_ingest(reconciler: &Reconciler, command: IngestCommand) -> Result<()> {
    match command {
        IngestCommand::Text {
            source_type,
            text,
            context,
        } => {
            let text = match text {
                Some(text) => text,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("reading payload from stdin")?;
                    buf
                }
            };
            let outcome = reconciler
                .ingest_text(source_type, &text, context.into())
                .await?;
            print_json(&outcome)
        }
        IngestCommand::File {
            source_type,
            path,
            context,
        } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("bin");
            let outcome = reconciler
                .ingest_file(source_type, &bytes, ext, context.into())
                .await?;
            print_json(&outcome)
        }
    }
}

async fn run_transactions(reconciler: &Reconciler, command: TransactionCommand) -> Result<()> {
    match command {
        TransactionCommand::List { filter } => {
            print_json(&reconciler.list_transactions(&filter.into()).await?)
        }
        TransactionCommand::Summary { filter } => {
            print_json(&reconciler.transaction_summary(&filter.into()).await?)
        }
        TransactionCommand::Show { id } => {
            print_json(&reconciler.get_transaction(TransactionId(id)).await?)
        }
        TransactionCommand::Sources { id } => {
            print_json(&reconciler.transaction_sources(TransactionId(id)).await?)
        }
        TransactionCommand::Edit { id, fields } => {
            let edit = TransactionEdit {
                amount: fields.amount,
                currency: fields.currency,
                transaction_datetime: fields.transaction_datetime,
                posting_datetime: fields.posting_datetime,
                description: fields.description,
                location: fields.location,
                kind: fields.kind,
                fx_fee: fields.fx_fee,
            };
            if edit.is_empty() {
                bail!("nothing to edit; pass at least one field");
            }
            print_json(&reconciler.edit_transaction(TransactionId(id), edit).await?)
        }
        TransactionCommand::Delete { id } => {
            reconciler.delete_transaction(TransactionId(id)).await?;
            print_json(&serde_json::json!({ "deleted": id }))
        }
    }
}

async fn run_events(reconciler: &Reconciler, command: EventCommand) -> Result<()> {
    match command {
        EventCommand::List {
            source_type,
            status,
            linked,
            limit,
            offset,
        } => {
            let filter = SourceEventFilter {
                source_type,
                parse_status: status,
                has_transaction: linked,
                limit: Some(limit),
                offset: Some(offset),
            };
            print_json(&reconciler.list_source_events(&filter).await?)
        }
        EventCommand::Show { id } => {
            print_json(&reconciler.get_source_event(SourceEventId(id)).await?)
        }
    }
}
