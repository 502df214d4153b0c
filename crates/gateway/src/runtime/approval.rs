//! Bridges the tool registry's destructive-command gate to the shared
//! human-approval broker (SPEC_FULL §4.4), resolving requests by prompting
//! on the controlling terminal.
//!
//! The broker itself doesn't know or care who resolves a request — a future
//! HTTP front end would call `ApprovalBroker::resolve` from a handler
//! instead. This CLI-only resolver is the one front end this spec ships.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use sa_approval::ApprovalBroker;
use sa_tools::ConfirmCallback;

pub struct ApprovalConfirm {
    pub approval: Arc<ApprovalBroker>,
    pub owner: String,
    pub timeout: Duration,
}

#[async_trait::async_trait]
impl ConfirmCallback for ApprovalConfirm {
    async fn confirm(&self, message: &str) -> bool {
        let id = self.approval.request(message, &self.owner);
        let owner = self.owner.clone();
        let broker = self.approval.clone();
        let prompt_message = message.to_string();
        tokio::spawn(async move {
            let approved = tokio::task::spawn_blocking(move || prompt_yes_no(&prompt_message))
                .await
                .unwrap_or(false);
            broker.resolve(id, approved, &owner);
        });
        self.approval.wait(id, self.timeout).await
    }
}

fn prompt_yes_no(message: &str) -> bool {
    eprint!("\x1B[33mapprove?\x1B[0m {message} [y/N] ");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolving_the_broker_directly_unblocks_confirm() {
        let broker = Arc::new(ApprovalBroker::new(Duration::from_secs(5)));
        let confirm = ApprovalConfirm {
            approval: broker.clone(),
            owner: "test".into(),
            timeout: Duration::from_secs(5),
        };
        // Exercise the broker side of the bridge without touching stdin:
        // request + resolve directly, mirroring what `confirm` does internally.
        let id = broker.request("rm -rf /tmp/x", "test");
        assert!(broker.resolve(id, true, "test"));
        assert!(broker.wait(id, Duration::from_secs(1)).await);
        let _ = confirm; // constructed to prove the type wiring compiles
    }
}
