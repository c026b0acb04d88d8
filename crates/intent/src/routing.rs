//! Routing Decision
//!
//! Turns a classified intent plus conversation context into what the chat UI
//! should do: run the generation inline, ask the user to confirm first, or
//! stay in plain chat.

use muse_shared::{Intent, IntentKind, RoutingAction, RoutingDecision};

/// Minimum confidence for silently executing a generation intent. Ambiguous
/// (noun-only) classifications fall below this and go through confirmation.
pub const CONFIRMATION_THRESHOLD: f64 = 0.8;

/// Conversation state the router needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingContext {
    pub has_active_project: bool,
    /// Kind of the active project, if any. An active project of a different
    /// kind does not block routing; the latest expressed intent wins.
    pub active_project_kind: Option<IntentKind>,
    /// The user already confirmed this kind of intent in this conversation.
    pub previously_confirmed: bool,
}

/// Decide how to route a classified intent.
pub fn decide(intent: &Intent, ctx: &RoutingContext) -> RoutingDecision {
    if intent.kind == IntentKind::Chat {
        return RoutingDecision {
            action: RoutingAction::ExecuteInline,
            target_kind: IntentKind::Chat,
            requires_new_project: !ctx.has_active_project,
        };
    }

    let unambiguous = intent.confidence >= CONFIRMATION_THRESHOLD || ctx.previously_confirmed;
    if unambiguous {
        // An active project of a different kind is deliberately overridden:
        // the user's latest expressed intent beats the project's original type
        if let Some(active) = ctx.active_project_kind {
            if active != intent.kind {
                tracing::debug!(
                    active = %active,
                    detected = %intent.kind,
                    "Routing past active project to newly expressed intent"
                );
            }
        }
        return RoutingDecision {
            action: RoutingAction::ExecuteInline,
            target_kind: intent.kind,
            requires_new_project: !ctx.has_active_project,
        };
    }

    if ctx.has_active_project {
        // Ambiguous phrasing never hijacks an in-progress project
        return RoutingDecision {
            action: RoutingAction::FallbackChat,
            target_kind: IntentKind::Chat,
            requires_new_project: false,
        };
    }

    RoutingDecision {
        action: RoutingAction::ConfirmWithUser,
        target_kind: intent.kind,
        requires_new_project: true,
    }
}
