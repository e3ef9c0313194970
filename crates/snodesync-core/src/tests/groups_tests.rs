use super::{account, harness, our_key, seed_group};
use crate::error::CoreError;
use crate::group_crypto::{unwrap_key_pair, HexKeyPair};
use crate::messaging::{Destination, GroupControlMessage, SnodeNamespace};
use crate::store::{ConversationStore, KeyPairStore, TimelineKind};
use x25519_dalek::{PublicKey, StaticSecret};

const GROUP: u8 = 0xA0;

fn starting_pair() -> HexKeyPair {
    HexKeyPair {
        public_hex: "01".repeat(32),
        private_hex: "02".repeat(32),
    }
}

/// Member whose secret the test holds, so wrapped pairs can be opened.
fn member_with_secret(seed: u8) -> (String, [u8; 32]) {
    let secret = [seed; 32];
    let public = PublicKey::from(&StaticSecret::from(secret));
    (format!("05{}", hex::encode(public.as_bytes())), secret)
}

#[tokio::test]
async fn removing_the_admin_alone_is_refused() {
    let (h, _) = harness().await;
    let group = account(GROUP);
    let admin = account(0xA1);
    seed_group(
        &h.conversations,
        &group,
        vec![admin.clone()],
        vec![admin.clone(), our_key(), account(0xA2)],
    )
    .await;

    let err = h
        .core
        .groups()
        .send_removed_members(&group, &[admin], &[our_key(), account(0xA2)], None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::GroupProtocolViolation(_)));
    assert_eq!(h.queue.attempts().await, 0);
}

#[tokio::test]
async fn removing_ourselves_is_refused() {
    let (h, _) = harness().await;
    let group = account(GROUP);
    seed_group(&h.conversations, &group, vec![our_key()], vec![our_key(), account(0xA2)]).await;

    let err = h
        .core
        .groups()
        .send_removed_members(&group, &[our_key()], &[account(0xA2)], None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::GroupProtocolViolation(_)));
    assert_eq!(h.queue.attempts().await, 0);
}

#[tokio::test]
async fn only_admins_rotate_keys() {
    let (h, _) = harness().await;
    let group = account(GROUP);
    seed_group(
        &h.conversations,
        &group,
        vec![account(0xA1)],
        vec![account(0xA1), our_key()],
    )
    .await;

    h.core
        .groups()
        .rotate_encryption_key_pair(&group, &[our_key()])
        .await
        .expect("no-op");
    assert_eq!(h.crypto.generated(), 0);
    assert_eq!(h.queue.attempts().await, 0);
}

#[tokio::test]
async fn removal_by_admin_rotates_for_the_remaining_members() {
    let (h, _) = harness().await;
    let group = account(GROUP);
    let (bob, bob_secret) = member_with_secret(0x07);
    let carol = account(0xA3);
    seed_group(
        &h.conversations,
        &group,
        vec![our_key()],
        vec![our_key(), bob.clone(), carol.clone()],
    )
    .await;
    h.key_pairs
        .add_key_pair(&group, starting_pair())
        .await
        .expect("seed pair");

    h.core
        .groups()
        .send_removed_members(&group, &[carol.clone()], &[our_key(), bob.clone()], None)
        .await
        .expect("removed");

    let sent = h.queue.sent().await;
    assert_eq!(sent.len(), 2);
    assert!(sent
        .iter()
        .all(|s| s.destination == Destination::Group(group.clone())
            && s.namespace == SnodeNamespace::ClosedGroupMessage));
    assert_eq!(
        sent[0].message.message,
        GroupControlMessage::MembersRemoved {
            members: vec![carol.clone()]
        }
    );
    let GroupControlMessage::EncryptionKeyPair { wrappers, .. } = &sent[1].message.message else {
        panic!("expected a key pair message, got {:?}", sent[1].message.message);
    };
    assert_eq!(wrappers.len(), 2);
    assert!(wrappers.iter().all(|w| w.recipient != carol));

    let latest = h
        .core
        .groups()
        .keyring()
        .latest(&group)
        .await
        .expect("latest")
        .expect("rotated");
    assert_ne!(latest, starting_pair());
    let bob_copy = wrappers
        .iter()
        .find(|w| w.recipient == bob)
        .expect("bob's copy");
    assert_eq!(unwrap_key_pair(bob_secret, bob_copy).expect("unwrap"), latest);
    assert_eq!(h.core.groups().keyring().in_flight(&group).await, None);
}

#[tokio::test]
async fn rejected_rotation_keeps_the_old_pair() {
    let (h, _) = harness().await;
    let group = account(GROUP);
    seed_group(&h.conversations, &group, vec![our_key()], vec![our_key(), account(0xA2)]).await;
    h.key_pairs
        .add_key_pair(&group, starting_pair())
        .await
        .expect("seed pair");
    h.queue.set_fail_all(true).await;

    let err = h
        .core
        .groups()
        .rotate_encryption_key_pair(&group, &[our_key(), account(0xA2)])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Transport(_)));
    let keyring = h.core.groups().keyring();
    assert_eq!(keyring.all(&group).await.expect("all"), vec![starting_pair()]);
    assert_eq!(keyring.in_flight(&group).await, None);
}

#[tokio::test]
async fn wrap_failure_aborts_before_sending() {
    let (h, _) = harness().await;
    let group = account(GROUP);
    seed_group(&h.conversations, &group, vec![our_key()], vec![our_key(), account(0xA2)]).await;
    h.crypto.set_fail_wrap(true);

    let err = h
        .core
        .groups()
        .rotate_encryption_key_pair(&group, &[account(0xA2)])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::KeyRotation(_)));
    assert_eq!(h.queue.attempts().await, 0);
    assert_eq!(h.core.groups().keyring().latest(&group).await.expect("latest"), None);
}

#[tokio::test]
async fn local_edit_sends_each_part_of_the_diff() {
    let (h, _) = harness().await;
    let group = account(GROUP);
    let bob = account(0xA2);
    let carol = account(0xA3);
    let dave = account(0xA4);
    seed_group(
        &h.conversations,
        &group,
        vec![our_key()],
        vec![our_key(), bob.clone(), carol.clone()],
    )
    .await;
    h.key_pairs
        .add_key_pair(&group, starting_pair())
        .await
        .expect("seed pair");

    let diff = h
        .core
        .groups()
        .initiate_update(&group, "renamed", vec![our_key(), carol.clone(), dave.clone()])
        .await
        .expect("update");
    assert_eq!(diff.new_name.as_deref(), Some("renamed"));
    assert_eq!(diff.joining_members, Some(vec![dave.clone()]));
    assert_eq!(diff.leaving_members, Some(vec![bob.clone()]));

    let convo = h.conversations.get(&group).await.expect("get").expect("group");
    assert_eq!(convo.display_name.as_deref(), Some("renamed"));
    assert_eq!(convo.members, vec![our_key(), carol.clone(), dave.clone()]);
    assert_eq!(convo.admins, vec![our_key()]);

    let sent = h.queue.sent().await;
    let kinds: Vec<&GroupControlMessage> = sent.iter().map(|s| &s.message.message).collect();
    assert!(matches!(kinds[0], GroupControlMessage::NameChange { name } if name == "renamed"));
    assert!(matches!(kinds[1], GroupControlMessage::MembersAdded { .. }));
    let to_dave = sent
        .iter()
        .find(|s| s.destination == Destination::Pubkey(dave.clone()))
        .expect("new member gets the group");
    let GroupControlMessage::New {
        members, key_pair, ..
    } = &to_dave.message.message
    else {
        panic!("expected group state for the new member");
    };
    assert_eq!(members, &vec![our_key(), carol.clone(), dave.clone()]);
    assert_eq!(key_pair, &starting_pair());
    assert!(kinds
        .iter()
        .any(|m| matches!(m, GroupControlMessage::MembersRemoved { members } if members == &vec![bob.clone()])));
    assert!(matches!(
        kinds.last(),
        Some(GroupControlMessage::EncryptionKeyPair { .. })
    ));

    let updates = h
        .conversations
        .messages(&group)
        .await
        .expect("timeline")
        .into_iter()
        .filter(|m| matches!(m.kind, TimelineKind::GroupUpdate(_)) && m.outgoing)
        .count();
    assert_eq!(updates, 3);
}

#[tokio::test]
async fn adding_members_needs_a_key_pair() {
    let (h, _) = harness().await;
    let group = account(GROUP);
    seed_group(&h.conversations, &group, vec![our_key()], vec![our_key()]).await;

    let err = h
        .core
        .groups()
        .initiate_update(&group, "crew", vec![our_key(), account(0xA4)])
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::NotFound);
    assert!(h.queue.sent().await.is_empty());
}

#[tokio::test]
async fn admin_leaving_dissolves_the_group() {
    let (h, _) = harness().await;
    let group = account(GROUP);
    seed_group(&h.conversations, &group, vec![our_key()], vec![our_key(), account(0xA2)]).await;
    h.key_pairs
        .add_key_pair(&group, starting_pair())
        .await
        .expect("seed pair");
    h.core.subscriptions().add_pubkey(&group).await;

    h.core.groups().leave_group(&group).await.expect("left");

    let sent = h.queue.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message.message, GroupControlMessage::MemberLeft);
    let convo = h.conversations.get(&group).await.expect("get").expect("group");
    assert!(convo.left);
    assert!(convo.members.is_empty() && convo.admins.is_empty());
    assert!(!h.core.subscriptions().is_polled(&group).await);
    assert!(h.key_pairs.key_pairs(&group).await.expect("pairs").is_empty());
}

#[tokio::test]
async fn member_leaving_only_removes_itself() {
    let (h, _) = harness().await;
    let group = account(GROUP);
    let admin = account(0xA1);
    seed_group(
        &h.conversations,
        &group,
        vec![admin.clone()],
        vec![admin.clone(), our_key()],
    )
    .await;

    h.core.groups().leave_group(&group).await.expect("left");

    let convo = h.conversations.get(&group).await.expect("get").expect("group");
    assert_eq!(convo.members, vec![admin.clone()]);
    assert_eq!(convo.admins, vec![admin]);
    assert!(convo.left);
}

#[tokio::test]
async fn unconfirmed_leave_keeps_polling() {
    let (h, _) = harness().await;
    let group = account(GROUP);
    seed_group(&h.conversations, &group, vec![account(0xA1)], vec![our_key()]).await;
    h.core.subscriptions().add_pubkey(&group).await;
    h.queue.set_fail_all(true).await;

    let err = h.core.groups().leave_group(&group).await.unwrap_err();
    assert!(matches!(err, CoreError::Transport(_)));
    assert!(h.core.subscriptions().is_polled(&group).await);
    let convo = h.conversations.get(&group).await.expect("get").expect("group");
    assert!(!convo.left);

    let missing = h.core.groups().leave_group(&account(0xAF)).await.unwrap_err();
    assert_eq!(missing, CoreError::NotFound);
}

#[tokio::test]
async fn local_timer_changes_are_sent() {
    let (h, _) = harness().await;
    let group = account(GROUP);
    seed_group(&h.conversations, &group, vec![our_key()], vec![our_key()]).await;

    let changed = h
        .core
        .groups()
        .update_expire_timer(&group, 300, &our_key(), 50, false)
        .await
        .expect("timer");
    assert!(changed);
    let sent = h.queue.sent().await;
    assert_eq!(
        sent[0].message.message,
        GroupControlMessage::ExpirationTimerUpdate { seconds: 300 }
    );
    assert_eq!(sent[0].message.sent_at, 50);

    let unchanged = h
        .core
        .groups()
        .update_expire_timer(&group, 300, &our_key(), 60, false)
        .await
        .expect("same timer");
    assert!(!unchanged);
    assert_eq!(h.queue.attempts().await, 1);
}

#[tokio::test]
async fn empty_name_change_is_not_sent() {
    let (h, _) = harness().await;
    let group = account(GROUP);
    seed_group(&h.conversations, &group, vec![our_key()], vec![our_key()]).await;

    h.core
        .groups()
        .send_new_name(&group, "", "name-1".to_string())
        .await
        .expect("skipped");
    assert_eq!(h.queue.attempts().await, 0);
}

#[tokio::test]
async fn unconfirmed_removal_does_not_rotate() {
    let (h, _) = harness().await;
    let group = account(GROUP);
    let bob = account(0xA2);
    seed_group(
        &h.conversations,
        &group,
        vec![our_key()],
        vec![our_key(), bob.clone(), account(0xA3)],
    )
    .await;
    h.key_pairs
        .add_key_pair(&group, starting_pair())
        .await
        .expect("seed pair");
    h.queue.set_fail_all(true).await;

    let err = h
        .core
        .groups()
        .send_removed_members(&group, &[account(0xA3)], &[our_key(), bob], None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Transport(_)));
    assert_eq!(h.queue.attempts().await, 1);
    assert_eq!(h.crypto.generated(), 0);
    let keyring = h.core.groups().keyring();
    assert_eq!(keyring.all(&group).await.expect("all"), vec![starting_pair()]);
    assert_eq!(keyring.in_flight(&group).await, None);
}

#[tokio::test]
async fn refused_edit_leaves_the_group_untouched() {
    let (h, _) = harness().await;
    let group = account(GROUP);
    let admin = account(0xA1);
    let bob = account(0xA2);
    seed_group(
        &h.conversations,
        &group,
        vec![admin.clone()],
        vec![admin.clone(), our_key(), bob.clone()],
    )
    .await;

    let err = h
        .core
        .groups()
        .initiate_update(&group, "renamed", vec![our_key(), bob.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::GroupProtocolViolation(_)));
    assert_eq!(h.queue.attempts().await, 0);
    let convo = h.conversations.get(&group).await.expect("get").expect("group");
    assert_eq!(convo.members, vec![admin, our_key(), bob]);
    assert_eq!(convo.display_name.as_deref(), Some("crew"));
}
