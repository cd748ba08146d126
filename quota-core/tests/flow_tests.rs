//! End-to-end flow tests over an in-process network

mod common;

use common::TestNetwork;
use quota_core::{
    assemble_transfer,
    flow::FlowEvent,
    network::SignResponse,
    selector::select_inputs,
    types::{Command, CommandData, LedgerTransaction, TransactionState, WireTransaction},
    Config, CounterpartyState, Error, FinalityError, FinalityService, FlowState, Identity, Party,
    QuotaRecord, SignedTransaction, SigningPolicy, StateAndRef,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

fn drain(rx: &mut broadcast::Receiver<FlowEvent>) -> Vec<FlowEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Unsigned one-output transfer of `input` to `to`
fn spend(input: StateAndRef, to: &Party, amount: u64, notary: &Party) -> SignedTransaction {
    let mill = input.record().mill.clone();
    let tx = WireTransaction {
        inputs: vec![input.reference],
        outputs: vec![TransactionState::quota(
            QuotaRecord::new(mill.clone(), to.clone(), amount),
            notary.clone(),
        )],
        commands: vec![Command::new(
            CommandData::Transfer,
            vec![mill.owning_key, to.owning_key],
        )],
        notary: notary.clone(),
        privacy_salt: [5u8; 32],
    };
    SignedTransaction::new(tx, vec![input])
}

async fn ask(net: &TestNetwork, to: &Party, from: &Party, stx: SignedTransaction) -> SignResponse {
    net.network
        .request_signature(to, Uuid::now_v7(), from, stx, Duration::from_secs(2))
        .await
        .unwrap()
}

fn refusal(response: SignResponse) -> String {
    match response {
        SignResponse::Rejected(reason) => reason,
        SignResponse::Signed(_) => panic!("transaction was signed"),
    }
}

struct RefuseAll;

impl SigningPolicy for RefuseAll {
    fn check(&self, _signer: &Party, _ltx: &LedgerTransaction) -> Result<(), String> {
        Err("Not buying quota today".to_string())
    }
}

#[tokio::test]
async fn test_issue() {
    let net = TestNetwork::new();
    let mill = net.node("Mill", 1);
    let mut events = mill.subscribe();

    let tx_id = mill.issue(50).await.unwrap();

    assert_eq!(mill.balance(mill.party()).unwrap(), 50);
    let unspent = mill.unspent().unwrap();
    assert_eq!(unspent.len(), 1);
    assert_eq!(unspent[0].reference.tx_id, tx_id);
    assert!(mill.in_flight_flows().unwrap().is_empty());
    assert_eq!(mill.metrics().flows_finalized.get(), 1);

    let states: Vec<FlowState> = drain(&mut events).into_iter().map(|e| e.state).collect();
    assert_eq!(
        states,
        vec![
            FlowState::LocallySigned,
            FlowState::FullySigned,
            FlowState::SubmittedForFinality,
            FlowState::Finalized,
        ]
    );
}

#[tokio::test]
async fn test_issue_zero_never_reaches_notary() {
    let net = TestNetwork::new();
    let mill = net.node("Mill", 1);

    let err = mill.issue(0).await.unwrap_err();
    assert!(matches!(err, Error::Contract(_)));
    assert!(err.to_string().contains("Positive amount expected"));
    assert_eq!(mill.metrics().flows_started.get(), 0);
    assert_eq!(net.notary.unspent_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_transfer_with_change() {
    let net = TestNetwork::new();
    let mill = net.node("Mill", 1);
    let alice = net.node("Alice", 3);
    let bob = net.node("Bob", 4);

    for amount in [5, 3, 4] {
        mill.issue(amount).await.unwrap();
    }

    mill.transfer(mill.party(), 6, alice.party()).await.unwrap();
    assert_eq!(mill.balance(mill.party()).unwrap(), 6);
    assert_eq!(alice.balance(mill.party()).unwrap(), 6);

    // Alice passes it on; the mill and Bob countersign
    let mut events = alice.subscribe();
    alice.transfer(mill.party(), 4, bob.party()).await.unwrap();
    assert_eq!(alice.balance(mill.party()).unwrap(), 2);
    assert_eq!(bob.balance(mill.party()).unwrap(), 4);
    assert_eq!(mill.balance(mill.party()).unwrap(), 6);

    let events = drain(&mut events);
    assert!(events.iter().any(|e| e.state == FlowState::AwaitingCounterpartySignatures));
    let flow_id = events[0].flow_id;
    let initiator = alice.party();
    assert_eq!(bob.counterparty_state(initiator, flow_id), Some(CounterpartyState::Finalized));
    assert_eq!(mill.counterparty_state(initiator, flow_id), Some(CounterpartyState::Finalized));
    assert_eq!(bob.counterparty_state(mill.party(), flow_id), None);

    // The mill stores every record it issued that is still unspent
    let mill_view: u64 = mill.unspent().unwrap().iter().map(|s| s.record().amount).sum();
    assert_eq!(mill_view, 12);
}

#[tokio::test]
async fn test_transfer_insufficient_balance() {
    let net = TestNetwork::new();
    let mill = net.node("Mill", 1);
    let alice = net.node("Alice", 3);

    mill.issue(2).await.unwrap();
    mill.issue(2).await.unwrap();

    let err = mill.transfer(mill.party(), 5, alice.party()).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientBalance { requested: 5, available: 4 }));
    assert_eq!(mill.reserved_count(), 0);
    assert_eq!(mill.metrics().flows_started.get(), 2);
}

#[tokio::test]
async fn test_counterparty_rejection() {
    let net = TestNetwork::new();
    let mill = net.node("Mill", 1);
    let bob = net
        .builder("Bob", 4)
        .signing_policy(Arc::new(RefuseAll))
        .start()
        .unwrap();

    mill.issue(10).await.unwrap();
    let mut events = mill.subscribe();

    let err = mill.transfer(mill.party(), 4, bob.party()).await.unwrap_err();
    match &err {
        Error::Rejected { party, reason, .. } => {
            assert_eq!(party, "Bob");
            assert!(reason.contains("Not buying"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!err.is_retryable());

    let events = drain(&mut events);
    assert!(events.iter().all(|e| e.state != FlowState::SubmittedForFinality));
    assert_eq!(events.last().map(|e| e.state), Some(FlowState::Rejected));
    assert_eq!(
        bob.counterparty_state(mill.party(), events[0].flow_id),
        Some(CounterpartyState::Rejected)
    );

    // Nothing moved, nothing stays reserved
    assert_eq!(mill.balance(mill.party()).unwrap(), 10);
    assert_eq!(bob.balance(mill.party()).unwrap(), 0);
    assert_eq!(mill.reserved_count(), 0);
    assert!(mill.in_flight_flows().unwrap().is_empty());
    assert_eq!(mill.metrics().flows_rejected.get(), 1);
}

#[tokio::test]
async fn test_tampered_transaction_rejected_by_counterparty() {
    let net = TestNetwork::new();
    let mill = net.node("Mill", 1);
    let _bob = net.node("Bob", 4);
    let mill_identity = Identity::from_seed("Mill", &[1u8; 32]);
    let bob_party = net.network.resolve("Bob").unwrap();

    mill.issue(10).await.unwrap();
    let input = mill.unspent().unwrap().remove(0);

    // Inflates the output beyond the input
    let tx = WireTransaction {
        inputs: vec![input.reference],
        outputs: vec![TransactionState::quota(
            QuotaRecord::new(mill.party().clone(), bob_party.clone(), 15),
            net.notary.party().clone(),
        )],
        commands: vec![Command::new(
            CommandData::Transfer,
            vec![mill.party().owning_key, bob_party.owning_key],
        )],
        notary: net.notary.party().clone(),
        privacy_salt: [5u8; 32],
    };
    let mut stx = SignedTransaction::new(tx, vec![input]);
    stx.add_signature(mill_identity.sign_transaction(&stx.id()));

    let response = net
        .network
        .request_signature(&bob_party, Uuid::now_v7(), mill.party(), stx, Duration::from_secs(2))
        .await
        .unwrap();
    match response {
        SignResponse::Rejected(reason) => assert!(reason.contains("Incorrect Spending")),
        SignResponse::Signed(_) => panic!("tampered transaction was signed"),
    }
}

#[tokio::test]
async fn test_forged_input_signed_by_counterparty_refused_by_notary() {
    let net = TestNetwork::new();
    let mill = net.node("Mill", 1);
    let bob = net.node("Bob", 4);
    let mill_identity = Identity::from_seed("Mill", &[1u8; 32]);
    let bob_identity = Identity::from_seed("Bob", &[4u8; 32]);

    mill.issue(10).await.unwrap();
    let mut forged = mill.unspent().unwrap().remove(0);
    forged.state = TransactionState::quota(
        QuotaRecord::new(mill.party().clone(), mill.party().clone(), 15),
        net.notary.party().clone(),
    );

    // Inputs and outputs balance at 15, so the counterparty cannot tell
    let mut stx = spend(forged, bob.party(), 15, net.notary.party());
    stx.add_signature(mill_identity.sign_transaction(&stx.id()));
    match ask(&net, bob.party(), mill.party(), stx.clone()).await {
        SignResponse::Signed(signature) => {
            assert_eq!(signature.by, bob_identity.owning_key());
            stx.add_signature(signature);
        }
        SignResponse::Rejected(reason) => panic!("counterparty refused: {reason}"),
    }

    match net.notary.submit(stx).await.unwrap_err() {
        Error::Finality(FinalityError::Rejected { reason, .. }) => {
            assert!(reason.contains("does not match"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(mill.balance(mill.party()).unwrap(), 10);
    assert_eq!(net.notary.unspent_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_sign_request_to_non_signer_refused() {
    let net = TestNetwork::new();
    let mill = net.node("Mill", 1);
    let alice = net.node("Alice", 3);
    let bob_party = Identity::from_seed("Bob", &[4u8; 32]).party().clone();
    let mill_identity = Identity::from_seed("Mill", &[1u8; 32]);

    mill.issue(10).await.unwrap();
    let input = mill.unspent().unwrap().remove(0);
    let mut stx = spend(input, &bob_party, 10, net.notary.party());
    stx.add_signature(mill_identity.sign_transaction(&stx.id()));

    let reason = refusal(ask(&net, alice.party(), mill.party(), stx).await);
    assert!(reason.contains("is not a required signer"), "{reason}");
    assert_eq!(alice.metrics().verification_failures.get(), 1);
}

#[tokio::test]
async fn test_sign_request_without_initiator_signature_refused() {
    let net = TestNetwork::new();
    let mill = net.node("Mill", 1);
    let bob = net.node("Bob", 4);

    mill.issue(10).await.unwrap();
    let input = mill.unspent().unwrap().remove(0);
    let stx = spend(input, bob.party(), 10, net.notary.party());

    let reason = refusal(ask(&net, bob.party(), mill.party(), stx).await);
    assert!(reason.contains("is not signed by initiator"), "{reason}");
}

#[tokio::test]
async fn test_sign_request_naming_other_notary_refused() {
    let net = TestNetwork::new();
    let mill = net.node("Mill", 1);
    let bob = net.node("Bob", 4);
    let rogue = Identity::from_seed("RogueNotary", &[0xBB; 32]);
    let mill_identity = Identity::from_seed("Mill", &[1u8; 32]);

    mill.issue(10).await.unwrap();
    let input = mill.unspent().unwrap().remove(0);
    let mut stx = spend(input, bob.party(), 10, rogue.party());
    stx.add_signature(mill_identity.sign_transaction(&stx.id()));

    let reason = refusal(ask(&net, bob.party(), mill.party(), stx).await);
    assert!(reason.contains("unexpected notary"), "{reason}");
}

#[tokio::test]
async fn test_double_spend_refused_by_notary() {
    let net = TestNetwork::new();
    let mill = net.node("Mill", 1);
    let alice = Identity::from_seed("Alice", &[3u8; 32]);
    let mill_identity = Identity::from_seed("Mill", &[1u8; 32]);

    let issue_id = mill.issue(10).await.unwrap();
    let records = mill.unspent().unwrap();

    let spend = |amount: u64| {
        let selection = select_inputs(&records, mill.party(), mill.party(), amount).unwrap();
        let builder = assemble_transfer(
            &selection,
            mill.party(),
            mill.party(),
            amount,
            alice.party(),
            net.notary.party(),
        )
        .unwrap();
        let mut stx = builder.sign_initial_transaction(&mill_identity).unwrap();
        stx.add_signature(alice.sign_transaction(&stx.id()));
        stx
    };

    net.notary.submit(spend(3)).await.unwrap();
    let err = net.notary.submit(spend(7)).await.unwrap_err();
    match err {
        Error::Finality(FinalityError::Conflict { refs }) => {
            assert_eq!(refs.len(), 1);
            assert_eq!(refs[0].tx_id, issue_id);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_concurrent_transfers_use_distinct_records() {
    let net = TestNetwork::new();
    let mill = net.node("Mill", 1);
    let alice = net.node("Alice", 3);
    let bob = net.node("Bob", 4);

    mill.issue(5).await.unwrap();
    mill.issue(5).await.unwrap();

    let (to_alice, to_bob) = tokio::join!(
        mill.transfer(mill.party(), 5, alice.party()),
        mill.transfer(mill.party(), 5, bob.party()),
    );
    to_alice.unwrap();
    to_bob.unwrap();

    assert_eq!(alice.balance(mill.party()).unwrap(), 5);
    assert_eq!(bob.balance(mill.party()).unwrap(), 5);
    assert_eq!(mill.balance(mill.party()).unwrap(), 0);
    assert_eq!(mill.metrics().notary_conflicts.get(), 0);

    let err = mill.transfer(mill.party(), 1, alice.party()).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientBalance { .. }));
}

#[tokio::test]
async fn test_unknown_counterparty_fails_flow() {
    let net = TestNetwork::new();
    let mill = net.node("Mill", 1);
    let stranger = Identity::from_seed("Stranger", &[7u8; 32]);

    mill.issue(10).await.unwrap();
    let mut events = mill.subscribe();

    let err = mill.transfer(mill.party(), 4, stranger.party()).await.unwrap_err();
    assert!(matches!(err, Error::UnknownParty(_)));
    assert_eq!(drain(&mut events).last().map(|e| e.state), Some(FlowState::Failed));
    assert_eq!(mill.reserved_count(), 0);
    assert_eq!(mill.metrics().flows_failed.get(), 1);
}

#[tokio::test]
async fn test_session_timeout_is_retryable() {
    let net = TestNetwork::new();
    let mut config = Config::default();
    config.flow.session_timeout_ms = 50;
    let mill = net.builder("Mill", 1).config(config).start().unwrap();

    // A registered party that never answers
    let ghost = Identity::from_seed("Ghost", &[8u8; 32]);
    let (tx, _rx) = mpsc::channel(4);
    net.network.register(ghost.party().clone(), tx);

    mill.issue(10).await.unwrap();
    let err = mill.transfer(mill.party(), 4, ghost.party()).await.unwrap_err();

    assert!(matches!(err, Error::Session(_)));
    assert!(err.is_retryable());
    assert_eq!(mill.balance(mill.party()).unwrap(), 10);
    assert_eq!(mill.reserved_count(), 0);

    // The reservation is gone, so the same records can be selected again
    let retry = mill.transfer(mill.party(), 4, mill.party()).await;
    assert!(retry.is_ok());
}

#[tokio::test]
async fn test_cancelled_transfer_releases_reservation() {
    let net = TestNetwork::new();
    let mut config = Config::default();
    config.flow.session_timeout_ms = 10_000;
    let mill = net.builder("Mill", 1).config(config).start().unwrap();

    // A registered party that never answers
    let ghost = Identity::from_seed("Ghost", &[8u8; 32]);
    let (tx, _rx) = mpsc::channel(4);
    net.network.register(ghost.party().clone(), tx);

    mill.issue(10).await.unwrap();
    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        mill.transfer(mill.party(), 4, ghost.party()),
    )
    .await;
    assert!(cancelled.is_err());

    assert_eq!(mill.reserved_count(), 0);
    assert!(mill.in_flight_flows().unwrap().is_empty());
    assert_eq!(mill.metrics().in_flight.get(), 0);
    assert_eq!(mill.metrics().flows_failed.get(), 1);

    mill.transfer(mill.party(), 4, mill.party()).await.unwrap();
    assert_eq!(mill.balance(mill.party()).unwrap(), 10);
    assert_eq!(mill.unspent().unwrap().len(), 2);
}

#[tokio::test]
async fn test_balance_overflow_is_an_error() {
    let net = TestNetwork::new();
    let mill = net.node("Mill", 1);

    mill.issue(u64::MAX).await.unwrap();
    mill.issue(1).await.unwrap();

    let err = mill.balance(mill.party()).unwrap_err();
    assert!(matches!(err, Error::Contract(_)));
    assert!(err.to_string().contains("Amount overflow"));
}

#[tokio::test]
async fn test_persistent_vault_survives_restart() {
    let temp_dir = tempfile::tempdir().unwrap();
    let net = TestNetwork::new();

    let mut config = Config::default();
    config.persistent = true;
    config.data_dir = temp_dir.path().to_path_buf();

    let mill = net.builder("Mill", 1).config(config.clone()).start().unwrap();
    let alice = net.node("Alice", 3);
    mill.issue(9).await.unwrap();
    mill.transfer(mill.party(), 4, alice.party()).await.unwrap();
    mill.shutdown().await.unwrap();

    let mill = net.builder("Mill", 1).config(config).start().unwrap();
    assert_eq!(mill.balance(mill.party()).unwrap(), 5);
    assert_eq!(mill.unspent().unwrap().len(), 2);
    assert!(mill.in_flight_flows().unwrap().is_empty());
}
