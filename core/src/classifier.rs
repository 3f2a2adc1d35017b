//! Classifier: partitions a batch of proposed tool calls into
//! auto-allowed, auto-denied and needs-user-input sets, deferring the
//! actual allow/ask/deny decision to the Permission Engine.

use std::collections::HashMap;

use serde_json::Value;

use crate::engine::EngineContext;
use crate::engine::check;
use crate::types::Decision;
use crate::types::PermissionResult;
use crate::types::ToolQuery;

/// One proposed tool call awaiting classification.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub tool_call_id: String,
    pub tool_name: Option<String>,
    pub tool_args_json: Option<String>,
}

/// Options controlling how a `PermissionResult` is folded into a bucket.
pub struct ClassifierOptions<'a> {
    pub always_requires_user_input: &'a dyn Fn(&str) -> bool,
    pub treat_ask_as_deny: bool,
    pub deny_reason_for_ask: String,
    pub missing_name_reason: String,
    pub require_args_for_auto_approve: bool,
    pub required_args: &'a dyn Fn(&str) -> &'a [&'a str],
}

#[derive(Debug, Clone)]
pub struct ClassifiedRequest {
    pub request: ApprovalRequest,
    pub args: HashMap<String, Value>,
    pub result: PermissionResult,
}

#[derive(Debug, Clone, Default)]
pub struct ClassificationOutcome {
    pub needs_user_input: Vec<ClassifiedRequest>,
    pub auto_allowed: Vec<ClassifiedRequest>,
    pub auto_denied: Vec<ClassifiedRequest>,
}

pub fn classify(
    requests: &[ApprovalRequest],
    ctx: &EngineContext<'_>,
    opts: &ClassifierOptions<'_>,
) -> ClassificationOutcome {
    let mut outcome = ClassificationOutcome::default();

    for request in requests {
        let Some(tool_name) = request.tool_name.clone() else {
            outcome.auto_denied.push(ClassifiedRequest {
                request: request.clone(),
                args: HashMap::new(),
                result: PermissionResult::deny(opts.missing_name_reason.clone(), None, vec![]),
            });
            continue;
        };

        let args: HashMap<String, Value> = request
            .tool_args_json
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default();

        let query = ToolQuery::new(tool_name.clone(), args.clone());
        let mut result = check(&query, ctx);

        if opts.require_args_for_auto_approve && result.decision == Decision::Allow {
            let required = (opts.required_args)(&tool_name);
            if required.iter().any(|key| !args.contains_key(*key)) {
                result = PermissionResult::ask(result.matched_rule, result.trace);
            }
        }

        if result.decision == Decision::Allow && (opts.always_requires_user_input)(&tool_name) {
            result = PermissionResult::ask(result.matched_rule, result.trace);
        }

        if opts.treat_ask_as_deny && result.decision == Decision::Ask {
            result = PermissionResult::deny(opts.deny_reason_for_ask.clone(), result.matched_rule, result.trace);
        }

        let classified = ClassifiedRequest {
            request: request.clone(),
            args,
            result,
        };

        match classified.result.decision {
            Decision::Allow => outcome.auto_allowed.push(classified),
            Decision::Deny => outcome.auto_denied.push(classified),
            Decision::Ask => outcome.needs_user_input.push(classified),
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::ModeController;
    use crate::mode::PermissionMode;
    use crate::rules::RuleStore;
    use std::path::PathBuf;

    fn base_opts() -> ClassifierOptions<'static> {
        ClassifierOptions {
            always_requires_user_input: &|tool| matches!(tool, "AskUserQuestion" | "EnterPlanMode" | "ExitPlanMode"),
            treat_ask_as_deny: false,
            deny_reason_for_ask: "denied".to_string(),
            missing_name_reason: "missing tool name".to_string(),
            require_args_for_auto_approve: true,
            required_args: &|_| &[],
        }
    }

    #[test]
    fn missing_tool_name_is_auto_denied() {
        let rules = RuleStore::default();
        let mode = ModeController::new(PermissionMode::Default);
        let wd = PathBuf::from("/u/p");
        let ctx = EngineContext {
            rules: &rules,
            mode: &mode,
            working_dir: &wd,
            agent_id: None,
        };
        let requests = vec![ApprovalRequest {
            tool_call_id: "1".to_string(),
            tool_name: None,
            tool_args_json: None,
        }];
        let outcome = classify(&requests, &ctx, &base_opts());
        assert_eq!(outcome.auto_denied.len(), 1);
        assert!(outcome.auto_allowed.is_empty());
        assert!(outcome.needs_user_input.is_empty());
    }

    #[test]
    fn read_within_working_directory_is_auto_allowed() {
        let rules = RuleStore::default();
        let mode = ModeController::new(PermissionMode::Default);
        let wd = PathBuf::from("/u/p");
        let ctx = EngineContext {
            rules: &rules,
            mode: &mode,
            working_dir: &wd,
            agent_id: None,
        };
        let requests = vec![ApprovalRequest {
            tool_call_id: "1".to_string(),
            tool_name: Some("Read".to_string()),
            tool_args_json: Some(r#"{"file_path":"src/a.ts"}"#.to_string()),
        }];
        let outcome = classify(&requests, &ctx, &base_opts());
        assert_eq!(outcome.auto_allowed.len(), 1);
    }

    #[test]
    fn always_requires_user_input_downgrades_allow_to_ask() {
        let rules = RuleStore::default();
        let mode = ModeController::new(PermissionMode::BypassPermissions);
        let wd = PathBuf::from("/u/p");
        let ctx = EngineContext {
            rules: &rules,
            mode: &mode,
            working_dir: &wd,
            agent_id: None,
        };
        let requests = vec![ApprovalRequest {
            tool_call_id: "1".to_string(),
            tool_name: Some("EnterPlanMode".to_string()),
            tool_args_json: Some("{}".to_string()),
        }];
        let outcome = classify(&requests, &ctx, &base_opts());
        assert_eq!(outcome.needs_user_input.len(), 1);
    }

    #[test]
    fn missing_required_arg_blocks_auto_approve() {
        let rules = RuleStore::default();
        let mode = ModeController::new(PermissionMode::BypassPermissions);
        let wd = PathBuf::from("/u/p");
        let ctx = EngineContext {
            rules: &rules,
            mode: &mode,
            working_dir: &wd,
            agent_id: None,
        };
        let mut opts = base_opts();
        opts.required_args = &|tool| if tool == "Write" { &["file_path"] } else { &[] };
        let requests = vec![ApprovalRequest {
            tool_call_id: "1".to_string(),
            tool_name: Some("Write".to_string()),
            tool_args_json: Some("{}".to_string()),
        }];
        let outcome = classify(&requests, &ctx, &opts);
        assert_eq!(outcome.needs_user_input.len(), 1);
    }
}
