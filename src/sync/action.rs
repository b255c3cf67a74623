use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::remote::Collection;

/// Delivery attempts before an action is dropped.
pub const MAX_ATTEMPTS: u32 = 5;

/// Queued actions older than this are discarded on load.
pub fn retention() -> Duration {
  Duration::days(7)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionVerb {
  Create,
  Delete,
}

/// A replayable user mutation, one payload shape per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Mutation {
  WishlistAdd {
    user_id: String,
    product_id: String,
  },
  WishlistRemove {
    id: String,
  },
  ReviewCreate {
    product_id: String,
    user_id: String,
    rating: u8,
    #[serde(default)]
    comment: Option<String>,
  },
  ReviewDelete {
    id: String,
  },
}

impl Mutation {
  pub fn verb(&self) -> ActionVerb {
    match self {
      Mutation::WishlistAdd { .. } | Mutation::ReviewCreate { .. } => ActionVerb::Create,
      Mutation::WishlistRemove { .. } | Mutation::ReviewDelete { .. } => ActionVerb::Delete,
    }
  }

  pub fn collection(&self) -> Collection {
    match self {
      Mutation::WishlistAdd { .. } | Mutation::WishlistRemove { .. } => Collection::Wishlist,
      Mutation::ReviewCreate { .. } | Mutation::ReviewDelete { .. } => Collection::Reviews,
    }
  }

  pub fn label(&self) -> &'static str {
    match self {
      Mutation::WishlistAdd { .. } => "wishlist_add",
      Mutation::WishlistRemove { .. } => "wishlist_remove",
      Mutation::ReviewCreate { .. } => "review_create",
      Mutation::ReviewDelete { .. } => "review_delete",
    }
  }
}

/// A mutation waiting to be sent to the data service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
  pub id: Uuid,
  pub mutation: Mutation,
  pub enqueued_at: DateTime<Utc>,
  pub attempts: u32,
}

impl PendingAction {
  pub fn new(mutation: Mutation, now: DateTime<Utc>) -> Self {
    Self {
      id: Uuid::new_v4(),
      mutation,
      enqueued_at: now,
      attempts: 0,
    }
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now - self.enqueued_at >= retention()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_wire_format() {
    let now = "2026-03-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
    let action = PendingAction::new(
      Mutation::WishlistAdd {
        user_id: "u1".into(),
        product_id: "p1".into(),
      },
      now,
    );
    let json = serde_json::to_value(&action).unwrap();

    assert_eq!(json["mutation"]["kind"], "wishlist_add");
    assert_eq!(json["mutation"]["payload"]["product_id"], "p1");
    assert_eq!(json["enqueuedAt"], "2026-03-01T12:00:00Z");
    assert_eq!(json["attempts"], 0);
    assert_eq!(serde_json::from_value::<PendingAction>(json).unwrap(), action);
  }

  #[test]
  fn test_unknown_kind_is_rejected() {
    let json = json!({
      "id": Uuid::new_v4(),
      "mutation": {"kind": "order_cancel", "payload": {"id": "o1"}},
      "enqueuedAt": "2026-03-01T12:00:00Z",
      "attempts": 0,
    });
    assert!(serde_json::from_value::<PendingAction>(json).is_err());
  }

  #[test]
  fn test_dispatch_targets() {
    let review = Mutation::ReviewCreate {
      product_id: "p1".into(),
      user_id: "u1".into(),
      rating: 4,
      comment: None,
    };
    assert_eq!(review.verb(), ActionVerb::Create);
    assert_eq!(review.collection(), Collection::Reviews);

    let removal = Mutation::WishlistRemove { id: "w9".into() };
    assert_eq!(removal.verb(), ActionVerb::Delete);
    assert_eq!(removal.collection(), Collection::Wishlist);
  }

  #[test]
  fn test_retention_boundary() {
    let now = Utc::now();
    let action = PendingAction::new(Mutation::ReviewDelete { id: "r1".into() }, now);
    assert!(!action.is_expired(now + Duration::days(7) - Duration::seconds(1)));
    assert!(action.is_expired(now + Duration::days(7)));
  }
}
