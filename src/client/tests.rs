use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use rand::{rngs::StdRng, SeedableRng};

use super::*;
use crate::abiencode::types::{Hash, U256};
use crate::abiencode::{AbiEncodings, AbiType, AbiValue};
use crate::commitments::{Commitment, InstallCommitment};
use crate::keys::Xpub;
use crate::protocol::{
    InstallParams, InstallVirtualAppParams, ProposeParams, Protocol, SetupParams,
    TakeActionParams, UninstallParams, UninstallVirtualAppParams, WithdrawParams,
};
use crate::state::OutcomeSpec;
use crate::store::MemoryStore;
use crate::wire::CustomData;

const ETH: Address = Address([0u8; 20]);
const NOW: u64 = 1_000;

/// Delivers envelopes as JSON, so every test run exercises the wire format.
#[derive(Debug, Clone, Default)]
struct TestBus {
    inboxes: Rc<RefCell<HashMap<Xpub, VecDeque<String>>>>,
}

impl MessageBus for TestBus {
    fn send(&self, to: &Xpub, envelope: &Envelope) {
        self.inboxes
            .borrow_mut()
            .entry(*to)
            .or_default()
            .push_back(envelope.to_json());
    }
}

impl TestBus {
    fn pop(&self, to: Xpub) -> Option<Envelope> {
        let raw = self.inboxes.borrow_mut().get_mut(&to)?.pop_front()?;
        Some(Envelope::from_json(&raw).unwrap())
    }
}

fn node(bus: &TestBus, seed: u64) -> Node<TestBus> {
    let mut rng = StdRng::seed_from_u64(seed);
    Node::new(
        bus.clone(),
        NetworkContext::for_testing(),
        Wallet::random(&mut rng),
        Box::new(MemoryStore::new()),
    )
}

fn root(node: &Node<TestBus>) -> Address {
    node.xpub().derive_address(0).unwrap()
}

/// Deliver queued envelopes until the network is quiet.
fn pump(bus: &TestBus, nodes: &mut [&mut Node<TestBus>]) {
    loop {
        let mut progressed = false;
        for node in nodes.iter_mut() {
            while let Some(envelope) = bus.pop(node.xpub()) {
                node.handle_message(&envelope, NOW).unwrap();
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
}

fn open_channel(
    bus: &TestBus,
    rng: &mut StdRng,
    a: &mut Node<TestBus>,
    b: &mut Node<TestBus>,
    multisig: Address,
) {
    let params = ProtocolParams::Setup(SetupParams {
        multisig_address: multisig,
        initiator: a.xpub(),
        responder: b.xpub(),
    });
    a.initiate(rng, params, NOW).unwrap();
    pump(bus, &mut [a, b]);
    assert!(a.channel(multisig).is_some());
    assert!(b.channel(multisig).is_some());
}

fn fund_both(a: &mut Node<TestBus>, b: &mut Node<TestBus>, multisig: Address, amount: U256) {
    let (ra, rb) = (root(a), root(b));
    for node in [a, b] {
        node.credit(multisig, ETH, ra, amount).unwrap();
        node.credit(multisig, ETH, rb, amount).unwrap();
    }
}

fn counter_app(a: &Node<TestBus>, b: &Node<TestBus>) -> ProposeParams {
    ProposeParams {
        responder: b.xpub(),
        app_definition: Address([0xdd; 20]),
        abi_encodings: AbiEncodings {
            state: vec![AbiType::Uint256],
            action: Some(vec![AbiType::Uint256]),
        },
        initiator_deposit: U256::from(3),
        initiator_deposit_token: ETH,
        responder_deposit: U256::from(2),
        responder_deposit_token: ETH,
        default_timeout: 100,
        // Selector 2 splits the locked amount (3, 2).
        initial_state: vec![AbiValue::Uint(U256::from(2))],
        outcome: OutcomeSpec::TwoPartyFixedOutcome {
            token: ETH,
            amount: U256::from(5),
            beneficiaries: [root(a), root(b)],
        },
    }
}

const CHAN: Address = Address([0xc1; 20]);

#[test]
fn setup_commits_identical_channels_on_both_nodes() {
    let bus = TestBus::default();
    let mut rng = StdRng::seed_from_u64(40);
    let (mut a, mut b) = (node(&bus, 1), node(&bus, 2));

    open_channel(&bus, &mut rng, &mut a, &mut b, CHAN);

    let (ca, cb) = (a.channel(CHAN).unwrap(), b.channel(CHAN).unwrap());
    assert_eq!(ca, cb);
    assert_eq!(ca.owners().len(), 2);
    // Owners sorted ascending by root address on both sides.
    let roots = ca.free_balance().participants();
    assert!(roots[0] < roots[1]);
}

#[test]
fn propose_install_uninstall_restores_free_balance() {
    let bus = TestBus::default();
    let mut rng = StdRng::seed_from_u64(41);
    let (mut a, mut b) = (node(&bus, 1), node(&bus, 2));
    open_channel(&bus, &mut rng, &mut a, &mut b, CHAN);
    fund_both(&mut a, &mut b, CHAN, U256::from(10));

    a.initiate(&mut rng, ProtocolParams::Propose(counter_app(&a, &b)), NOW)
        .unwrap();
    pump(&bus, &mut [&mut a, &mut b]);

    let id = a.channel(CHAN).unwrap().proposals().next().unwrap().identity_hash;
    assert!(b.channel(CHAN).unwrap().has_proposal(id));

    a.initiate(
        &mut rng,
        ProtocolParams::Install(InstallParams {
            app_identity_hash: id,
        }),
        NOW,
    )
    .unwrap();
    pump(&bus, &mut [&mut a, &mut b]);

    for n in [&a, &b] {
        let c = n.channel(CHAN).unwrap();
        assert!(c.has_app(id));
        assert_eq!(c.get_free_balance_for(ETH, root(&a)), U256::from(7));
        assert_eq!(c.get_free_balance_for(ETH, root(&b)), U256::from(8));
    }

    b.initiate(
        &mut rng,
        ProtocolParams::Uninstall(UninstallParams {
            app_identity_hash: id,
        }),
        NOW,
    )
    .unwrap();
    pump(&bus, &mut [&mut a, &mut b]);

    for n in [&a, &b] {
        let c = n.channel(CHAN).unwrap();
        assert!(!c.has_app(id));
        assert_eq!(c.get_free_balance_for(ETH, root(&a)), U256::from(10));
        assert_eq!(c.get_free_balance_for(ETH, root(&b)), U256::from(10));
    }
}

#[test]
fn take_action_advances_version_on_both_nodes() {
    let bus = TestBus::default();
    let mut rng = StdRng::seed_from_u64(42);
    let (mut a, mut b) = (node(&bus, 1), node(&bus, 2));
    open_channel(&bus, &mut rng, &mut a, &mut b, CHAN);
    fund_both(&mut a, &mut b, CHAN, U256::from(10));

    a.initiate(&mut rng, ProtocolParams::Propose(counter_app(&a, &b)), NOW)
        .unwrap();
    pump(&bus, &mut [&mut a, &mut b]);
    let id = a.channel(CHAN).unwrap().proposals().next().unwrap().identity_hash;
    a.initiate(
        &mut rng,
        ProtocolParams::Install(InstallParams {
            app_identity_hash: id,
        }),
        NOW,
    )
    .unwrap();
    pump(&bus, &mut [&mut a, &mut b]);

    b.initiate(
        &mut rng,
        ProtocolParams::TakeAction(TakeActionParams {
            app_identity_hash: id,
            action: vec![AbiValue::Uint(U256::one())],
            new_state: vec![AbiValue::Uint(U256::zero())],
        }),
        NOW,
    )
    .unwrap();
    pump(&bus, &mut [&mut a, &mut b]);

    for n in [&a, &b] {
        let app = n.channel(CHAN).unwrap().app(id).unwrap();
        assert_eq!(app.latest_version_number, 1);
        assert_eq!(app.latest_state, vec![AbiValue::Uint(U256::zero())]);
    }
}

#[test]
fn withdraw_deducts_on_both_nodes() {
    let bus = TestBus::default();
    let mut rng = StdRng::seed_from_u64(43);
    let (mut a, mut b) = (node(&bus, 1), node(&bus, 2));
    open_channel(&bus, &mut rng, &mut a, &mut b, CHAN);
    fund_both(&mut a, &mut b, CHAN, U256::from(10));

    a.initiate(
        &mut rng,
        ProtocolParams::Withdraw(WithdrawParams {
            multisig_address: CHAN,
            recipient: Address([0xee; 20]),
            token: ETH,
            amount: U256::from(4),
        }),
        NOW,
    )
    .unwrap();
    pump(&bus, &mut [&mut a, &mut b]);

    for n in [&a, &b] {
        let c = n.channel(CHAN).unwrap();
        assert_eq!(c.get_free_balance_for(ETH, root(&a)), U256::from(6));
        assert_eq!(c.get_free_balance_for(ETH, root(&b)), U256::from(10));
    }
}

#[test]
fn virtual_app_keeps_intermediary_net_neutral() {
    let bus = TestBus::default();
    let mut rng = StdRng::seed_from_u64(44);
    let (mut a, mut m, mut b) = (node(&bus, 1), node(&bus, 2), node(&bus, 3));
    let left = Address([0xa1; 20]);
    let right = Address([0xb1; 20]);
    open_channel(&bus, &mut rng, &mut a, &mut m, left);
    open_channel(&bus, &mut rng, &mut m, &mut b, right);
    fund_both(&mut a, &mut m, left, U256::from(5));
    fund_both(&mut m, &mut b, right, U256::from(5));

    a.initiate(
        &mut rng,
        ProtocolParams::InstallVirtualApp(InstallVirtualAppParams {
            initiator: a.xpub(),
            intermediary: m.xpub(),
            responder: b.xpub(),
            app_definition: Address([0xdd; 20]),
            abi_encodings: AbiEncodings {
                state: vec![AbiType::Uint256],
                action: Some(vec![AbiType::Uint256]),
            },
            initiator_deposit: U256::from(5),
            responder_deposit: U256::from(5),
            token: ETH,
            default_timeout: 100,
            initial_state: vec![AbiValue::Uint(U256::from(2))],
        }),
        NOW,
    )
    .unwrap();
    pump(&bus, &mut [&mut a, &mut m, &mut b]);

    // The full capital is locked in both direct channels.
    for n in [&a, &m] {
        let c = n.channel(left).unwrap();
        assert_eq!(c.get_free_balance_for(ETH, root(&a)), U256::zero());
        assert_eq!(c.get_free_balance_for(ETH, root(&m)), U256::zero());
    }
    for n in [&m, &b] {
        let c = n.channel(right).unwrap();
        assert_eq!(c.get_free_balance_for(ETH, root(&m)), U256::zero());
        assert_eq!(c.get_free_balance_for(ETH, root(&b)), U256::zero());
    }

    // All three hold the virtual ledger with exactly the one app.
    let vchan = a.virtual_channels().next().unwrap();
    let id = vchan.apps().next().unwrap().identity_hash();
    assert_eq!(m.virtual_channels().next().unwrap().apps().count(), 1);
    assert_eq!(b.virtual_channels().next().unwrap().apps().count(), 1);

    // The endpoints play without the intermediary seeing anything.
    a.initiate(
        &mut rng,
        ProtocolParams::TakeAction(TakeActionParams {
            app_identity_hash: id,
            action: vec![AbiValue::Uint(U256::one())],
            // Selector 0: the initiator takes the whole capital.
            new_state: vec![AbiValue::Uint(U256::zero())],
        }),
        NOW,
    )
    .unwrap();
    pump(&bus, &mut [&mut a, &mut b]);
    assert_eq!(
        a.virtual_channels().next().unwrap().app(id).unwrap().latest_version_number,
        1
    );

    a.initiate(
        &mut rng,
        ProtocolParams::UninstallVirtualApp(UninstallVirtualAppParams {
            initiator: a.xpub(),
            intermediary: m.xpub(),
            responder: b.xpub(),
            app_identity_hash: id,
            final_state: vec![AbiValue::Uint(U256::zero())],
        }),
        NOW,
    )
    .unwrap();
    pump(&bus, &mut [&mut a, &mut m, &mut b]);

    // The winner collects in its direct channel, the intermediary recoups
    // what it fronted, and ends with exactly what it started with.
    for n in [&a, &m] {
        let c = n.channel(left).unwrap();
        assert_eq!(c.get_free_balance_for(ETH, root(&a)), U256::from(10));
        assert_eq!(c.get_free_balance_for(ETH, root(&m)), U256::zero());
    }
    for n in [&m, &b] {
        let c = n.channel(right).unwrap();
        assert_eq!(c.get_free_balance_for(ETH, root(&m)), U256::from(10));
        assert_eq!(c.get_free_balance_for(ETH, root(&b)), U256::zero());
    }
    for n in [&a, &m, &b] {
        assert_eq!(n.virtual_channels().next().unwrap().apps().count(), 0);
    }
}

#[test]
fn unanswered_instance_expires_without_state_change() {
    let bus = TestBus::default();
    let mut rng = StdRng::seed_from_u64(45);
    let (mut a, mut b) = (node(&bus, 1), node(&bus, 2));

    let pid = a
        .initiate(
            &mut rng,
            ProtocolParams::Setup(SetupParams {
                multisig_address: CHAN,
                initiator: a.xpub(),
                responder: b.xpub(),
            }),
            NOW,
        )
        .unwrap();

    assert_eq!(a.expire(NOW + PROTOCOL_TIMEOUT_SECS + 1), vec![pid]);
    assert!(a.channel(CHAN).is_none());

    // A late countersignature finds no instance to resume.
    let opening = bus.pop(b.xpub()).unwrap();
    b.handle_message(&opening, NOW).unwrap();
    let ack = bus.pop(a.xpub()).unwrap();
    assert!(matches!(
        a.handle_message(&ack, NOW),
        Err(ProtocolError::UnexpectedMessage { .. })
    ));
    assert!(a.channel(CHAN).is_none());
}

#[test]
fn instances_on_the_same_channel_serialize() {
    let bus = TestBus::default();
    let mut rng = StdRng::seed_from_u64(46);
    let (mut a, mut b) = (node(&bus, 1), node(&bus, 2));
    open_channel(&bus, &mut rng, &mut a, &mut b, CHAN);
    fund_both(&mut a, &mut b, CHAN, U256::from(10));

    // The second start is deferred behind the first's channel shard and runs
    // once the first instance finishes, picking up sequence number 2.
    a.initiate(&mut rng, ProtocolParams::Propose(counter_app(&a, &b)), NOW)
        .unwrap();
    a.initiate(&mut rng, ProtocolParams::Propose(counter_app(&a, &b)), NOW)
        .unwrap();
    pump(&bus, &mut [&mut a, &mut b]);

    for n in [&a, &b] {
        let c = n.channel(CHAN).unwrap();
        let mut seqs: Vec<u64> = c.proposals().map(|p| p.app_seq_no).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 2]);
    }
}

#[test]
fn tampered_signature_aborts_without_committing() {
    let bus = TestBus::default();
    let mut rng = StdRng::seed_from_u64(47);
    let (mut a, mut b) = (node(&bus, 1), node(&bus, 2));
    open_channel(&bus, &mut rng, &mut a, &mut b, CHAN);
    fund_both(&mut a, &mut b, CHAN, U256::from(10));

    a.initiate(&mut rng, ProtocolParams::Propose(counter_app(&a, &b)), NOW)
        .unwrap();
    pump(&bus, &mut [&mut a, &mut b]);
    let id = a.channel(CHAN).unwrap().proposals().next().unwrap().identity_hash;

    a.initiate(
        &mut rng,
        ProtocolParams::Install(InstallParams {
            app_identity_hash: id,
        }),
        NOW,
    )
    .unwrap();

    let mut opening = bus.pop(b.xpub()).unwrap();
    match &mut opening.custom_data {
        CustomData::Signature { signature } => signature.0[10] ^= 0xff,
        _ => panic!("install opening carries one signature"),
    }
    assert!(matches!(
        b.handle_message(&opening, NOW),
        Err(ProtocolError::Validation(_))
    ));

    // Nothing committed, nothing sent back.
    let c = b.channel(CHAN).unwrap();
    assert!(!c.has_app(id));
    assert!(c.has_proposal(id));
    assert_eq!(c.get_free_balance_for(ETH, root(&a)), U256::from(10));
    assert!(bus.pop(a.xpub()).is_none());
}

#[test]
fn install_signed_by_a_non_owner_is_rejected() {
    let bus = TestBus::default();
    let mut rng = StdRng::seed_from_u64(48);
    let (mut a, mut b) = (node(&bus, 1), node(&bus, 2));
    open_channel(&bus, &mut rng, &mut a, &mut b, CHAN);
    fund_both(&mut a, &mut b, CHAN, U256::from(10));

    a.initiate(&mut rng, ProtocolParams::Propose(counter_app(&a, &b)), NOW)
        .unwrap();
    pump(&bus, &mut [&mut a, &mut b]);
    let id = a.channel(CHAN).unwrap().proposals().next().unwrap().identity_hash;

    // Mallory reconstructs the genuine install digest from public state and
    // signs it with their own key, claiming to be the sender.
    let mallory = Wallet::random(&mut rng);
    let mut cache = KeyCache::new();
    let (candidate, app) = b.channel(CHAN).unwrap().install_app(id, &mut cache).unwrap();
    let digest =
        InstallCommitment::new(&NetworkContext::for_testing(), &candidate, &app).hash_to_sign();
    let signature = mallory.signer_for(0).unwrap().sign_eth(digest);

    let forged = Envelope {
        protocol: Protocol::Install,
        process_id: ProcessId::random(&mut rng),
        seq: 1,
        from: mallory.xpub(),
        to: b.xpub(),
        params: Some(ProtocolParams::Install(InstallParams {
            app_identity_hash: id,
        })),
        custom_data: CustomData::Signature { signature },
    };
    assert!(matches!(
        b.handle_message(&forged, NOW),
        Err(ProtocolError::SenderNotOwner(_))
    ));

    // Nothing installed, nothing deducted, no countersignature sent.
    let c = b.channel(CHAN).unwrap();
    assert!(!c.has_app(id));
    assert_eq!(c.get_free_balance_for(ETH, root(&a)), U256::from(10));
    assert!(bus.pop(mallory.xpub()).is_none());
}

#[test]
fn setup_naming_another_responder_is_rejected() {
    let bus = TestBus::default();
    let mut rng = StdRng::seed_from_u64(49);
    let (a, mut b) = (node(&bus, 1), node(&bus, 2));
    let carol = Wallet::random(&mut rng);

    let signature = carol.signer_for(0).unwrap().sign_eth(Hash([0u8; 32]));
    let forged = Envelope {
        protocol: Protocol::Setup,
        process_id: ProcessId::random(&mut rng),
        seq: 1,
        from: a.xpub(),
        to: b.xpub(),
        params: Some(ProtocolParams::Setup(SetupParams {
            multisig_address: CHAN,
            initiator: a.xpub(),
            responder: carol.xpub(),
        })),
        custom_data: CustomData::Signature { signature },
    };
    assert!(matches!(
        b.handle_message(&forged, NOW),
        Err(ProtocolError::SenderNotOwner(_))
    ));
    assert!(b.channel(CHAN).is_none());
}

#[test]
fn restarted_node_resumes_from_persisted_snapshots() {
    let bus = TestBus::default();
    let mut rng = StdRng::seed_from_u64(50);
    let wallet = Wallet::random(&mut rng);
    let mut a = Node::new(
        bus.clone(),
        NetworkContext::for_testing(),
        wallet.clone(),
        Box::new(MemoryStore::new()),
    );
    let mut b = node(&bus, 2);
    open_channel(&bus, &mut rng, &mut a, &mut b, CHAN);
    fund_both(&mut a, &mut b, CHAN, U256::from(10));

    let expected = a.channel(CHAN).unwrap().clone();
    let store = a.into_store();

    let mut a = Node::new(bus.clone(), NetworkContext::for_testing(), wallet, store);
    assert_eq!(a.channel(CHAN), Some(&expected));

    // The reloaded ledger carries the protocol forward.
    a.initiate(&mut rng, ProtocolParams::Propose(counter_app(&a, &b)), NOW)
        .unwrap();
    pump(&bus, &mut [&mut a, &mut b]);
    let id = a.channel(CHAN).unwrap().proposals().next().unwrap().identity_hash;
    assert!(b.channel(CHAN).unwrap().has_proposal(id));
}

#[test]
fn propose_without_a_channel_fails_cleanly() {
    let bus = TestBus::default();
    let mut rng = StdRng::seed_from_u64(48);
    let (mut a, b) = (node(&bus, 1), node(&bus, 2));

    let err = a
        .initiate(&mut rng, ProtocolParams::Propose(counter_app(&a, &b)), NOW)
        .unwrap_err();
    assert!(matches!(err, ProtocolError::NoChannelBetween(_)));
    assert!(bus.pop(b.xpub()).is_none());
}
