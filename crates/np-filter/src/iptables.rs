use crate::backend::Backend;
use async_trait::async_trait;
use np_core::{Chain, Error, Result, Rule, SetName, SetType, Table};
use tokio::process::Command;
use tracing::debug;

/// Drives the `iptables` and `ipset` binaries.
pub struct IptablesBackend {
    iptables: String,
    ipset: String,
    max_list_size: u32,
}

impl IptablesBackend {
    pub fn new(max_list_size: u32) -> Self {
        Self {
            iptables: "iptables".to_string(),
            ipset: "ipset".to_string(),
            max_list_size,
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!(program, args = %args.join(" "), "Running");

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| Error::Spawn {
                program: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Command {
                command: format!("{} {}", program, args.join(" ")),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn iptables(&self, table: Table, args: &[&str]) -> Result<String> {
        // -w waits for the xtables lock instead of failing when another
        // process holds it.
        let mut full = vec!["-w", "-t", table.as_str()];
        full.extend_from_slice(args);
        self.run(&self.iptables, &full).await
    }

    async fn ipset(&self, args: &[&str]) -> Result<String> {
        self.run(&self.ipset, args).await
    }
}

#[async_trait]
impl Backend for IptablesBackend {
    async fn clear_chain(&self, table: Table, chain: Chain) -> Result<()> {
        match self.new_chain(table, chain).await {
            Ok(()) => Ok(()),
            Err(Error::ChainExists { .. }) => {
                self.iptables(table, &["-F", chain.name()]).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn new_chain(&self, table: Table, chain: Chain) -> Result<()> {
        match self.iptables(table, &["-N", chain.name()]).await {
            Ok(_) => Ok(()),
            Err(Error::Command { stderr, .. }) if stderr.contains("Chain already exists") => {
                Err(Error::ChainExists { table, chain })
            }
            Err(e) => Err(e),
        }
    }

    async fn append_rule(&self, table: Table, chain: Chain, rule: &Rule) -> Result<()> {
        let mut args = vec!["-A", chain.name()];
        args.extend(rule.tokens().iter().map(String::as_str));
        self.iptables(table, &args).await?;
        Ok(())
    }

    async fn list_rules(&self, table: Table, chain: Chain) -> Result<Vec<Rule>> {
        match self.iptables(table, &["-S", chain.name()]).await {
            Ok(stdout) => Ok(parse_rule_specs(chain, &stdout)),
            Err(Error::Command { stderr, .. }) if stderr.contains("No chain/target/match") => {
                Err(Error::NoSuchChain { table, chain })
            }
            Err(e) => Err(e),
        }
    }

    async fn list_sets(&self, prefix: &str) -> Result<Vec<SetName>> {
        let stdout = self.ipset(&["list", "-n"]).await?;
        Ok(parse_set_names(prefix, &stdout))
    }

    async fn create_set(&self, set: &SetName, kind: SetType) -> Result<()> {
        let size = self.max_list_size.to_string();
        let mut args = vec!["create", set.as_str(), kind.as_str()];
        if kind == SetType::ListSet {
            args.extend(["size", size.as_str()]);
        }
        match self.ipset(&args).await {
            Ok(_) => Ok(()),
            Err(Error::Command { stderr, .. }) if stderr.contains("already exists") => {
                Err(Error::SetExists(set.clone()))
            }
            Err(e) => Err(e),
        }
    }

    async fn flush_set(&self, set: &SetName) -> Result<()> {
        self.ipset(&["flush", set.as_str()]).await?;
        Ok(())
    }

    async fn destroy_set(&self, set: &SetName) -> Result<()> {
        match self.ipset(&["destroy", set.as_str()]).await {
            Ok(_) => Ok(()),
            Err(Error::Command { stderr, .. }) if stderr.contains("in use") => {
                Err(Error::SetInUse(set.clone()))
            }
            Err(e) => Err(e),
        }
    }

    async fn add_entry(&self, set: &SetName, entry: &str) -> Result<()> {
        self.ipset(&["add", set.as_str(), entry, "-exist"]).await?;
        Ok(())
    }

    async fn del_entry(&self, set: &SetName, entry: &str) -> Result<()> {
        self.ipset(&["del", set.as_str(), entry, "-exist"]).await?;
        Ok(())
    }

    async fn list_entries(&self, set: &SetName) -> Result<Vec<String>> {
        match self.ipset(&["save", set.as_str()]).await {
            Ok(stdout) => Ok(parse_set_entries(set, &stdout)),
            Err(Error::Command { stderr, .. }) if stderr.contains("does not exist") => {
                Err(Error::NoSuchSet(set.clone()))
            }
            Err(e) => Err(e),
        }
    }
}

/// Parse `iptables -S <chain>` output into the chain's rules.
fn parse_rule_specs(chain: Chain, stdout: &str) -> Vec<Rule> {
    let prefix = format!("-A {} ", chain.name());
    stdout
        .lines()
        .filter_map(|line| line.trim_end().strip_prefix(&prefix))
        .map(Rule::parse)
        .collect()
}

fn parse_set_names(prefix: &str, stdout: &str) -> Vec<SetName> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|name| name.starts_with(prefix))
        .filter_map(|name| SetName::new(name).ok())
        .collect()
}

/// Parse `ipset save <set>` output into its members.
fn parse_set_entries(set: &SetName, stdout: &str) -> Vec<String> {
    let prefix = format!("add {} ", set);
    stdout
        .lines()
        .filter_map(|line| line.trim_end().strip_prefix(&prefix))
        .map(|entry| entry.split_whitespace().next().unwrap_or(entry).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_specs_skip_chain_declaration() {
        let stdout = "\
-N NETPOL-EGRESS
-A NETPOL-EGRESS -m state --state RELATED,ESTABLISHED -j RETURN
-A NETPOL-EGRESS -m mark ! --mark 0x40000/0x40000 -j DROP
";
        let rules = parse_rule_specs(Chain::Egress, stdout);
        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules[0].render(),
            "-m state --state RELATED,ESTABLISHED -j RETURN"
        );
        assert_eq!(rules[1].render(), "-m mark ! --mark 0x40000/0x40000 -j DROP");
    }

    #[test]
    fn empty_chain_has_no_rules() {
        assert!(parse_rule_specs(Chain::Main, "-N NETPOL\n").is_empty());
    }

    #[test]
    fn set_names_filtered_by_prefix() {
        let stdout = "weave-local-pods\nnetpol-local-pods\nnetpol-ns-default\nKUBE-CLUSTER-IP\n";
        let names = parse_set_names("netpol-", stdout);
        assert_eq!(
            names,
            vec![
                SetName::local_pods(),
                SetName::new("netpol-ns-default").unwrap()
            ]
        );

        let exact = parse_set_names("netpol-local-pods", stdout);
        assert_eq!(exact, vec![SetName::local_pods()]);
    }

    #[test]
    fn set_entries_from_save_output() {
        let stdout = "\
create netpol-local-pods hash:ip family inet hashsize 1024 maxelem 65536
add netpol-local-pods 10.32.0.4
add netpol-local-pods 10.32.0.7 comment \"default/web\"
";
        let entries = parse_set_entries(&SetName::local_pods(), stdout);
        assert_eq!(entries, vec!["10.32.0.4", "10.32.0.7"]);
    }
}
