use crate::backend::Backend;
use np_core::{Chain, Error, ReconcileMode, Result, Rule, Table};
use similar::{ChangeTag, TextDiff};
use tracing::debug;

/// Converges a chain to a desired rule list.
///
/// Safe to call on every object update: when the chain already holds exactly
/// the desired rules, in order, nothing is written.
pub struct ChainReconciler<'a> {
    backend: &'a dyn Backend,
    mode: ReconcileMode,
}

impl<'a> ChainReconciler<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self {
            backend,
            mode: ReconcileMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ReconcileMode) -> Self {
        self.mode = mode;
        self
    }

    pub async fn ensure_chain(&self, table: Table, chain: Chain, desired: &[Rule]) -> Result<()> {
        match self.backend.new_chain(table, chain).await {
            Ok(()) | Err(Error::ChainExists { .. }) => {}
            Err(e) => {
                return Err(Error::CreateChain {
                    table,
                    chain,
                    source: Box::new(e),
                });
            }
        }

        let current = self
            .backend
            .list_rules(table, chain)
            .await
            .map_err(|e| Error::ListRules {
                table,
                chain,
                source: Box::new(e),
            })?;

        let current_text = render_rules(&current);
        let desired_text = render_rules(desired);
        if current_text == desired_text {
            debug!(%chain, "Chain already up to date");
            return Ok(());
        }

        debug!(
            %chain,
            mode = %self.mode,
            diff = %render_diff(&current_text, &desired_text),
            "Chain differs from desired rules"
        );

        if self.mode == ReconcileMode::Replace {
            self.backend
                .clear_chain(table, chain)
                .await
                .map_err(|e| Error::ClearChain {
                    table,
                    chain,
                    source: Box::new(e),
                })?;
        }

        for rule in desired {
            self.backend
                .append_rule(table, chain, rule)
                .await
                .map_err(|e| Error::AppendRule {
                    table,
                    chain,
                    rule: rule.clone(),
                    source: Box::new(e),
                })?;
        }

        Ok(())
    }
}

fn render_rules(rules: &[Rule]) -> String {
    rules
        .iter()
        .map(Rule::render)
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_diff(current: &str, desired: &str) -> String {
    let diff = TextDiff::from_lines(current, desired);
    let mut output = String::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
            ChangeTag::Equal => ' ',
        };
        output.push(sign);
        output.push_str(change.value().trim_end());
        output.push('\n');
    }

    output
}
