//! Property tests for cursor pagination over `SqliteConversationStore`.
//! Generalizes the fixed-count `cursor_pagination_is_a_partition` unit test
//! in `db.rs` across randomized message counts and page sizes.

use super::{ConversationRepository, SqliteConversationStore};
use crate::domain::{MessageRole, UserId};
use proptest::prelude::*;
use std::collections::HashSet;

fn run<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Runtime::new().unwrap().block_on(fut)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Walking `list_messages` page by page via `next_cursor` until it's
    /// `None` visits every appended message exactly once, in append order,
    /// regardless of how many messages were appended or what page size was
    /// requested (spec.md §4.2 cursor pagination, strictly-after semantics).
    #[test]
    fn cursor_pagination_partitions_every_message(
        message_count in 0usize..40,
        page_size in 1u32..15,
    ) {
        run(async {
            let store = SqliteConversationStore::open_in_memory().unwrap();
            let owner = UserId("u1".to_string());
            let conv = store.create_conversation(&owner, "Hello").await.unwrap();

            let mut appended = Vec::new();
            for i in 0..message_count {
                let m = store
                    .append_message(&conv.id, Some(owner.clone()), &format!("msg {i}"), MessageRole::User, false)
                    .await
                    .unwrap();
                appended.push(m.id);
            }

            let mut seen = Vec::new();
            let mut cursor: Option<String> = None;
            loop {
                let page = store.list_messages(&conv.id, cursor.as_deref(), page_size, &owner).await.unwrap();
                prop_assert!(page.items.len() <= page_size as usize);
                seen.extend(page.items.iter().map(|m| m.id.clone()));
                match page.next_cursor {
                    Some(c) => cursor = Some(c),
                    None => break,
                }
            }

            prop_assert_eq!(&seen, &appended, "pagination did not visit messages in append order exactly once");
            let unique: HashSet<_> = seen.iter().collect();
            prop_assert_eq!(unique.len(), appended.len(), "pagination revisited or skipped a message");
            Ok(())
        })?;
    }
}
