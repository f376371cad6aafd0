use alloy_primitives::{address, Address, Bytes, U256};
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::sync::Mutex;

use payout_ledger::bulk::{parse_bulk_export, BulkExport, BulkRow};
use payout_ledger::chain::abi::{
    invalidateUnorderedNoncesCall, permitTransferFromCall, PermitTransferFrom,
    SignatureTransferDetails, TokenPermissions, PERMIT2_ADDRESS,
};
use payout_ledger::chain::{ChainTransaction, TransactionHistory};
use payout_ledger::diagnostics::DiagnosticKind;
use payout_ledger::error::{PipelineError, SourceError, StoreError};
use payout_ledger::github::{IssueCommentPage, IssueSource, Repository};
use payout_ledger::identity::{Identity, JsonIdentityStore};
use payout_ledger::ledger::LedgerEntry;
use payout_ledger::model::{address_key, Chain, IssueComment, SignatureKey, Tier, WXDAI};
use payout_ledger::store::{InsertOutcome, LedgerSink};
use payout_ledger::units::parse_units;
use payout_ledger::{Collaborators, Config, Pipeline};

const OWNER: Address = address!("44ca15db101fd1c194467db6af0c67c6bbf4ab51");
const ALICE: Address = address!("4007ce2083c7f3e18097aeb3a39bb8ec149a341d");
const BOB: Address = address!("9a2bcd1ff0ffd5b7a2e5ce4f3cfb7d6c2bd7c8e1");

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn signature(byte: u8) -> String {
    format!("0x{}", hex::encode([byte; 65]))
}

fn wxdai(amount: &str) -> U256 {
    parse_units(amount).unwrap()
}

fn permit_calldata(nonce: u64, amount: U256, to: Address, sig_byte: u8) -> String {
    let call = permitTransferFromCall {
        permit: PermitTransferFrom {
            permitted: TokenPermissions {
                token: WXDAI.address,
                amount,
            },
            nonce: U256::from(nonce),
            deadline: U256::from(1_900_000_000u64),
        },
        transferDetails: SignatureTransferDetails {
            to,
            requestedAmount: amount,
        },
        owner: OWNER,
        signature: Bytes::from(vec![sig_byte; 65]),
    };
    format!("0x{}", hex::encode(call.abi_encode()))
}

fn claim_link(nonce: u64, amount: U256, sig_byte: u8) -> String {
    let payload = json!({
        "permit": {
            "permitted": { "token": format!("{:#x}", WXDAI.address), "amount": amount.to_string() },
            "nonce": nonce.to_string(),
            "deadline": "1900000000"
        },
        "transferDetails": { "to": format!("{:#x}", ALICE), "requestedAmount": amount.to_string() },
        "owner": format!("{:#x}", OWNER),
        "signature": signature(sig_byte),
        "networkId": 100
    });
    format!("https://pay.ubq.fi?claim={}", STANDARD.encode(payload.to_string()))
}

fn reward_comment(issue: u64, amount: &str, nonce: u64, sig_byte: u8, secs: i64) -> IssueComment {
    IssueComment {
        repo_name: "app".to_string(),
        issue_number: issue,
        issue_url: format!("https://github.com/acme/app/issues/{}", issue),
        author: "ubiquibot".to_string(),
        creator: "bob".to_string(),
        assignee: Some("alice".to_string()),
        body: format!(
            "**CLAIM {} WXDAI**\n[CLAIM {} WXDAI]({})",
            amount,
            amount,
            claim_link(nonce, wxdai(amount), sig_byte)
        ),
        created_at: at(secs),
    }
}

struct Issues(Vec<IssueComment>);

#[async_trait]
impl IssueSource for Issues {
    async fn list_public_repositories(&self, _org: &str) -> Result<Vec<Repository>, SourceError> {
        Ok(vec![
            Repository { name: "app".to_string(), archived: false },
            Repository { name: "devpool-directory".to_string(), archived: false },
        ])
    }

    async fn issue_comments_page(
        &self,
        _org: &str,
        repo: &str,
        _cursor: Option<String>,
    ) -> Result<IssueCommentPage, SourceError> {
        let comments = if repo == "app" { self.0.clone() } else { Vec::new() };
        Ok(IssueCommentPage {
            comments,
            next_cursor: None,
        })
    }
}

/// Explorer that answers from a fixed transaction list
struct History(Vec<ChainTransaction>);

#[async_trait]
impl TransactionHistory for History {
    async fn transactions_for_address(
        &self,
        address: &Address,
        chain: Chain,
        _from_block: Option<u64>,
        _to_block: Option<u64>,
        selector: Option<&str>,
    ) -> Result<Vec<ChainTransaction>, SourceError> {
        Ok(self
            .0
            .iter()
            .filter(|tx| tx.chain == chain)
            .filter(|tx| tx.from == *address || tx.to == Some(*address))
            .filter(|tx| selector.map_or(true, |s| tx.has_selector(s)))
            .cloned()
            .collect())
    }
}

fn chain_tx(hash: &str, input: String, secs: i64) -> ChainTransaction {
    ChainTransaction {
        hash: hash.to_string(),
        input,
        from: OWNER,
        to: Some(PERMIT2_ADDRESS),
        timestamp: at(secs),
        method_selector: None,
        chain: Chain::Gnosis,
    }
}

fn invalidation_tx(hash: &str, word_pos: u64, bit_pos: u64, secs: i64) -> ChainTransaction {
    let call = invalidateUnorderedNoncesCall {
        wordPos: U256::from(word_pos),
        bitPos: U256::from(bit_pos),
    };
    chain_tx(hash, format!("0x{}", hex::encode(call.abi_encode())), secs)
}

#[derive(Default)]
struct MemorySink {
    ledger: Mutex<Vec<LedgerEntry>>,
    review: Mutex<Vec<LedgerEntry>>,
    non_attributable: Mutex<Vec<LedgerEntry>>,
}

#[async_trait]
impl LedgerSink for MemorySink {
    async fn list_existing_ledger_entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self.ledger.lock().unwrap().clone())
    }

    async fn insert_ledger_entries(
        &self,
        entries: Vec<LedgerEntry>,
    ) -> Result<InsertOutcome, StoreError> {
        let inserted = entries.len();
        self.ledger.lock().unwrap().extend(entries);
        Ok(InsertOutcome {
            inserted,
            failures: Vec::new(),
        })
    }

    async fn write_review(&self, entries: &[LedgerEntry]) -> Result<(), StoreError> {
        *self.review.lock().unwrap() = entries.to_vec();
        Ok(())
    }

    async fn write_non_attributable(&self, entries: &[LedgerEntry]) -> Result<(), StoreError> {
        *self.non_attributable.lock().unwrap() = entries.to_vec();
        Ok(())
    }
}

fn config() -> Config {
    Config {
        orgs: vec!["acme".to_string()],
        treasury_owners: vec![OWNER],
        ..Config::default()
    }
}

fn identities() -> JsonIdentityStore {
    JsonIdentityStore::from_identities([Identity {
        id: 1,
        username: Some("alice".to_string()),
        wallet_address: ALICE,
    }])
    .with_wallet(BOB)
}

/// Scenario data:
/// - 0x11 (nonce 1, 10 WXDAI to alice): comment twice, confirmed on chain
/// - 0x22 (nonce 2, 5 WXDAI to alice): comment only, nonce later invalidated
/// - 0x33 (nonce 3, 7 WXDAI to bob): bulk export only
fn fixture() -> (Issues, History, BulkExport) {
    let issues = Issues(vec![
        reward_comment(1, "10", 1, 0x11, 1_690_000_000),
        reward_comment(1, "10", 1, 0x11, 1_690_000_500),
        reward_comment(2, "5", 2, 0x22, 1_690_100_000),
    ]);
    let history = History(vec![
        chain_tx("0xAAA1", permit_calldata(1, wxdai("10"), ALICE, 0x11), 1_690_003_600),
        invalidation_tx("0xDEAD", 0, 2, 1_690_200_000),
    ]);
    let bulk = vec![BulkRow {
        hash: "0xBBB3".to_string(),
        input: Some(permit_calldata(3, wxdai("7"), BOB, 0x33)),
        chain_id: Some(100),
        timestamp: Some(at(1_690_300_000)),
    }];
    (issues, history, bulk.into())
}

#[tokio::test]
async fn test_full_run_reconciles_three_sources() {
    let (issues, history, bulk) = fixture();
    let identities = identities();
    let sink = MemorySink::default();
    let config = config();
    let deps = Collaborators {
        issues: &issues,
        history: &history,
        lookup: None,
        identities: &identities,
        sink: &sink,
    };

    let report = Pipeline::new(&config, deps).unwrap().run(bulk).await.unwrap();
    let ctx = &report.context;

    // comment + chain for the same signature
    let confirmed = SignatureKey::new(&signature(0x11));
    assert_eq!(ctx.tier_of(&confirmed), Some(Tier::Double));
    assert_eq!(ctx.merged[&confirmed].authorization.block_timestamp, Some(at(1_690_003_600)));
    assert_eq!(ctx.merged[&confirmed].authorization.transaction_hash.as_deref(), Some("0xaaa1"));

    // invalidated nonce is gone from every tier and from the leaderboard
    let burned = SignatureKey::new(&signature(0x22));
    assert_eq!(ctx.tier_of(&burned), None);
    assert!(!ctx.singles().contains(&burned));
    assert!(!ctx.doubles().contains(&burned));
    assert!(!ctx.triples().contains(&burned));
    assert_eq!(report.invalidated_nonces, ["2"]);
    assert_eq!(report.purged, [burned]);

    // the repeated comment does not inflate alice's total
    let alice = address_key(&ALICE);
    assert_eq!(report.leaderboards.authorized_total(&alice), wxdai("10"));
    assert_eq!(report.leaderboards.confirmed_total(&alice), wxdai("10"));
    assert_eq!(report.leaderboards.authorized_total(&address_key(&BOB)), wxdai("7"));

    // bob has a wallet but no user
    assert_eq!(report.persisted, 1);
    assert_eq!(report.non_attributable, 1);
    assert_eq!(sink.ledger.lock().unwrap()[0].signature, signature(0x11));
    assert_eq!(sink.non_attributable.lock().unwrap()[0].recipient, address_key(&BOB));

    // text tally counts the repeated payout once
    assert_eq!(report.tally[0].username, "alice");
    assert_eq!(report.tally[0].amount, wxdai("15"));
    assert!(report.metrics.contains("payout_ledger_invalidated_purged_total 1"));
}

#[tokio::test]
async fn test_second_run_persists_nothing_new() {
    let (issues, history, bulk) = fixture();
    let identities = identities();
    let sink = MemorySink::default();
    let config = config();
    let deps = Collaborators {
        issues: &issues,
        history: &history,
        lookup: None,
        identities: &identities,
        sink: &sink,
    };
    let pipeline = Pipeline::new(&config, deps).unwrap();

    let first = pipeline.run(bulk.clone()).await.unwrap();
    let second = pipeline.run(bulk).await.unwrap();

    assert_eq!(first.persisted, 1);
    assert_eq!(second.persisted, 0);
    assert_eq!(second.already_stored, 1);
    assert_eq!(sink.ledger.lock().unwrap().len(), 1);
    assert_eq!(first.tiers, second.tiers);
}

#[tokio::test]
async fn test_no_data_is_a_top_level_failure() {
    let issues = Issues(Vec::new());
    let history = History(Vec::new());
    let identities = JsonIdentityStore::default();
    let sink = MemorySink::default();
    let config = config();
    let deps = Collaborators {
        issues: &issues,
        history: &history,
        lookup: None,
        identities: &identities,
        sink: &sink,
    };

    let err = Pipeline::new(&config, deps).unwrap().run(BulkExport::default()).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::NoData)));
    assert_eq!(err.to_string(), "no data found processing all repositories");
}

#[tokio::test]
async fn test_unreadable_bulk_row_does_not_drop_the_export() {
    let (issues, history, _) = fixture();
    let export = json!([
        {
            "hash": "0xBBB3",
            "input": permit_calldata(3, wxdai("7"), BOB, 0x33),
            "chainId": 100,
            "timeStamp": "1690300000"
        },
        { "hash": "0xBBB4", "timeStamp": "n/a" }
    ]);
    let bulk = parse_bulk_export(&export.to_string()).unwrap();
    let identities = identities();
    let sink = MemorySink::default();
    let config = config();
    let deps = Collaborators {
        issues: &issues,
        history: &history,
        lookup: None,
        identities: &identities,
        sink: &sink,
    };

    let report = Pipeline::new(&config, deps).unwrap().run(bulk).await.unwrap();

    assert_eq!(report.leaderboards.authorized_total(&address_key(&BOB)), wxdai("7"));
    assert!(report
        .diagnostics
        .records()
        .iter()
        .any(|d| d.kind == DiagnosticKind::DecodeFailure && d.detail.contains("bulk row 1")));
}
