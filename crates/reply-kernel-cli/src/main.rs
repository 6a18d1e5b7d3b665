use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reply_kernel_api::{
    AddEntryRequest, AddRawRecordRequest, FeedbackSignal, InboundMessage, ReplyKernelApi,
    RetireEntryRequest, UpdateEntryRequest,
};
use reply_kernel_core::{EngineConfig, EntryId, OutcomeId, SourceType, TrustTier};
use reply_kernel_store_sqlite::SqliteStore;
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rk")]
#[command(about = "Reply Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./reply_kernel.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Knowledge {
        #[command(subcommand)]
        command: Box<KnowledgeCommand>,
    },
    Raw {
        #[command(subcommand)]
        command: Box<RawCommand>,
    },
    Decide(DecideArgs),
    Feedback(FeedbackArgs),
    Consolidate,
    Outcome {
        #[command(subcommand)]
        command: Box<OutcomeCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = true)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum KnowledgeCommand {
    Add(KnowledgeAddArgs),
    Update(KnowledgeUpdateArgs),
    Retire(KnowledgeRetireArgs),
    Search(KnowledgeSearchArgs),
    List(KnowledgeListArgs),
    Chain(KnowledgeChainArgs),
}

#[derive(Debug, Args)]
struct KnowledgeAddArgs {
    #[arg(long)]
    key: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    body: String,
    #[arg(long)]
    problem: Option<String>,
    #[arg(long)]
    solution: Option<String>,
    #[arg(long)]
    trust_tier: TrustTierArg,
    #[arg(long)]
    source_type: SourceTypeArg,
    #[arg(long)]
    confidence: f64,
    #[arg(long)]
    expires_at: Option<String>,
    #[arg(long = "supersedes")]
    supersedes: Vec<String>,
}

#[derive(Debug, Args)]
struct KnowledgeUpdateArgs {
    #[arg(long)]
    entry_id: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    body: Option<String>,
    #[arg(long)]
    problem: Option<String>,
    #[arg(long)]
    solution: Option<String>,
    #[arg(long)]
    confidence: Option<f64>,
}

#[derive(Debug, Args)]
struct KnowledgeRetireArgs {
    #[arg(long)]
    entry_id: String,
    #[arg(long)]
    replaced_by: Option<String>,
}

#[derive(Debug, Args)]
struct KnowledgeSearchArgs {
    #[arg(long)]
    query: String,
}

#[derive(Debug, Args)]
struct KnowledgeListArgs {
    #[arg(long, value_enum)]
    trust_tier: Option<TrustTierArg>,
}

#[derive(Debug, Args)]
struct KnowledgeChainArgs {
    #[arg(long)]
    entry_id: String,
}

#[derive(Debug, Subcommand)]
enum RawCommand {
    Add(RawAddArgs),
    List,
}

#[derive(Debug, Args)]
struct RawAddArgs {
    #[arg(long)]
    conversation_id: String,
    #[arg(long)]
    problem: String,
    #[arg(long)]
    solution: String,
    #[arg(long)]
    confidence: f64,
    #[arg(long)]
    captured_at: Option<String>,
}

#[derive(Debug, Args)]
struct DecideArgs {
    #[arg(long)]
    conversation_id: String,
    #[arg(long)]
    contact: Option<String>,
    #[arg(long)]
    text: String,
    #[arg(long)]
    received_at: Option<String>,
}

#[derive(Debug, Args)]
struct FeedbackArgs {
    #[arg(long)]
    outcome_id: String,
    #[arg(long, action = clap::ArgAction::Set)]
    helpful: bool,
}

#[derive(Debug, Subcommand)]
enum OutcomeCommand {
    Show(OutcomeShowArgs),
    List(OutcomeListArgs),
}

#[derive(Debug, Args)]
struct OutcomeShowArgs {
    #[arg(long)]
    outcome_id: String,
}

#[derive(Debug, Args)]
struct OutcomeListArgs {
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TrustTierArg {
    Verified,
    Learned,
    Raw,
}

impl From<TrustTierArg> for TrustTier {
    fn from(value: TrustTierArg) -> Self {
        match value {
            TrustTierArg::Verified => Self::Verified,
            TrustTierArg::Learned => Self::Learned,
            TrustTierArg::Raw => Self::Raw,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceTypeArg {
    Manual,
    ConversationExtract,
    PatternConsolidation,
}

impl From<SourceTypeArg> for SourceType {
    fn from(value: SourceTypeArg) -> Self {
        match value {
            SourceTypeArg::Manual => Self::Manual,
            SourceTypeArg::ConversationExtract => Self::ConversationExtract,
            SourceTypeArg::PatternConsolidation => Self::PatternConsolidation,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit_serialized<T: serde::Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize output")?)
}

fn parse_entry_id(raw: &str) -> Result<EntryId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid entry id: {raw}"))?;
    Ok(EntryId(parsed))
}

fn parse_outcome_id(raw: &str) -> Result<OutcomeId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid outcome id: {raw}"))?;
    Ok(OutcomeId(parsed))
}

fn parse_rfc3339_arg(raw: Option<&str>) -> Result<Option<OffsetDateTime>> {
    raw.map(|value| {
        OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
            .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
    })
    .transpose()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = ReplyKernelApi::new(cli.db.clone(), EngineConfig::default())?;

    match cli.command {
        Command::Db { command } => run_db(*command, &cli.db, &api),
        Command::Knowledge { command } => run_knowledge(*command, &api),
        Command::Raw { command } => run_raw(*command, &api),
        Command::Decide(args) => run_decide(&args, &api),
        Command::Feedback(args) => run_feedback(&args, &api),
        Command::Consolidate => run_consolidate(&api),
        Command::Outcome { command } => run_outcome(*command, &api),
    }
}

fn run_db(command: DbCommand, db_path: &std::path::Path, api: &ReplyKernelApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_serialized(&status)
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_serialized(&result)
        }
        DbCommand::Export(args) => {
            let mut store = SqliteStore::open(db_path)?;
            store.migrate()?;
            let manifest = store.export_snapshot(&args.out)?;
            emit_serialized(&manifest)
        }
        DbCommand::Import(args) => {
            let mut store = SqliteStore::open(db_path)?;
            let summary =
                store.import_snapshot(&args.input, args.skip_existing, &EngineConfig::default())?;
            emit_serialized(&summary)
        }
        DbCommand::Backup(args) => {
            let store = SqliteStore::open(db_path)?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup": args.out.display().to_string(),
                "ok": true
            }))
        }
        DbCommand::Restore(args) => {
            let mut store = SqliteStore::open(db_path)?;
            store.restore_database(&args.input)?;
            emit_json(serde_json::json!({
                "restored_from": args.input.display().to_string(),
                "ok": true
            }))
        }
        DbCommand::IntegrityCheck => {
            let mut store = SqliteStore::open(db_path)?;
            store.migrate()?;
            let report = store.integrity_check()?;
            emit_serialized(&report)
        }
    }
}

fn run_knowledge(command: KnowledgeCommand, api: &ReplyKernelApi) -> Result<()> {
    match command {
        KnowledgeCommand::Add(args) => {
            let supersedes = args
                .supersedes
                .iter()
                .map(|raw| parse_entry_id(raw))
                .collect::<Result<Vec<_>>>()?;
            let entry = api.add_entry(AddEntryRequest {
                key: args.key,
                title: args.title,
                body: args.body,
                problem: args.problem,
                solution: args.solution,
                trust_tier: args.trust_tier.into(),
                source_type: args.source_type.into(),
                confidence: args.confidence,
                entry_id: None,
                created_at: None,
                expires_at: parse_rfc3339_arg(args.expires_at.as_deref())?,
                supersedes,
            })?;
            emit_serialized(&entry)
        }
        KnowledgeCommand::Update(args) => {
            let entry = api.update_entry(UpdateEntryRequest {
                entry_id: parse_entry_id(&args.entry_id)?,
                title: args.title,
                body: args.body,
                problem: args.problem,
                solution: args.solution,
                confidence: args.confidence,
            })?;
            emit_serialized(&entry)
        }
        KnowledgeCommand::Retire(args) => {
            let entry_id = parse_entry_id(&args.entry_id)?;
            let replaced_by = args.replaced_by.as_deref().map(parse_entry_id).transpose()?;
            api.retire_entry(RetireEntryRequest { entry_id, replaced_by })?;
            emit_json(serde_json::json!({
                "entry_id": entry_id.to_string(),
                "retired": true
            }))
        }
        KnowledgeCommand::Search(args) => {
            let entries = api.search(&args.query)?;
            emit_json(serde_json::json!({
                "query": args.query,
                "entries": serde_json::to_value(&entries)?
            }))
        }
        KnowledgeCommand::List(args) => match args.trust_tier {
            Some(tier) => {
                let entries = api.list_by_tier(tier.into())?;
                emit_json(serde_json::json!({ "entries": serde_json::to_value(&entries)? }))
            }
            None => {
                let mut entries = Vec::new();
                for tier in [TrustTier::Verified, TrustTier::Learned, TrustTier::Raw] {
                    entries.extend(api.list_by_tier(tier)?);
                }
                emit_json(serde_json::json!({ "entries": serde_json::to_value(&entries)? }))
            }
        },
        KnowledgeCommand::Chain(args) => {
            let chain = api.supersession_chain(parse_entry_id(&args.entry_id)?)?;
            emit_json(serde_json::json!({ "chain": serde_json::to_value(&chain)? }))
        }
    }
}

fn run_raw(command: RawCommand, api: &ReplyKernelApi) -> Result<()> {
    match command {
        RawCommand::Add(args) => {
            let record = api.add_raw_record(AddRawRecordRequest {
                conversation_id: args.conversation_id,
                problem: args.problem,
                solution: args.solution,
                extraction_confidence: args.confidence,
                captured_at: parse_rfc3339_arg(args.captured_at.as_deref())?,
            })?;
            emit_serialized(&record)
        }
        RawCommand::List => {
            let records = api.list_unprocessed_raw()?;
            emit_json(serde_json::json!({ "records": serde_json::to_value(&records)? }))
        }
    }
}

fn run_decide(args: &DecideArgs, api: &ReplyKernelApi) -> Result<()> {
    let report = api.decide(InboundMessage {
        conversation_id: args.conversation_id.clone(),
        contact: args.contact.clone(),
        text: args.text.clone(),
        received_at: parse_rfc3339_arg(args.received_at.as_deref())?,
    })?;
    emit_serialized(&report)
}

fn run_feedback(args: &FeedbackArgs, api: &ReplyKernelApi) -> Result<()> {
    let applied = api.feedback(FeedbackSignal {
        outcome_id: parse_outcome_id(&args.outcome_id)?,
        helpful: args.helpful,
    })?;
    emit_serialized(&applied)
}

fn run_consolidate(api: &ReplyKernelApi) -> Result<()> {
    let summary = api.consolidate()?;
    emit_serialized(&summary)
}

fn run_outcome(command: OutcomeCommand, api: &ReplyKernelApi) -> Result<()> {
    match command {
        OutcomeCommand::Show(args) => {
            let outcome = api.outcome_show(parse_outcome_id(&args.outcome_id)?)?;
            emit_serialized(&outcome)
        }
        OutcomeCommand::List(args) => {
            if args.limit == 0 {
                return Err(anyhow!("limit MUST be >= 1"));
            }
            let outcomes = api.outcome_list(args.limit)?;
            emit_json(serde_json::json!({ "outcomes": serde_json::to_value(&outcomes)? }))
        }
    }
}
