use crate::backend::Backend;
use crate::probe::set_exists;
use crate::reconcile::ChainReconciler;
use np_core::{
    AUDIT_LOG_GROUP, Chain, ConnState, Direction, EGRESS_MARK, Error, ReconcileMode, Result, Rule,
    SetName, SetType, Table, Verdict, multicast_net,
};
use tracing::{debug, info};

/// Rules for the main chain, split around the point where the local-pods set
/// must exist.
pub fn main_rules(allow_multicast: bool) -> (Vec<Rule>, Rule) {
    let mut head = vec![
        Rule::builder()
            .state(ConnState::RelatedEstablished)
            .verdict(Verdict::Accept),
    ];
    if allow_multicast {
        head.push(
            Rule::builder()
                .dst_net(multicast_net())
                .verdict(Verdict::Accept),
        );
    }
    head.push(
        Rule::builder()
            .state(ConnState::New)
            .verdict(Verdict::Jump(Chain::Default)),
    );
    head.push(
        Rule::builder()
            .state(ConnState::New)
            .verdict(Verdict::Jump(Chain::Ingress)),
    );

    // Traffic not destined to a pod on this node is not ours to judge.
    let tail = Rule::builder()
        .not_in_set(&SetName::local_pods(), Direction::Dst)
        .verdict(Verdict::Accept);

    (head, tail)
}

pub fn egress_mark_rules() -> Vec<Rule> {
    vec![Rule::builder().verdict(Verdict::SetMark(EGRESS_MARK))]
}

pub fn egress_rules(allow_multicast: bool) -> Vec<Rule> {
    let mut rules = vec![
        Rule::builder()
            .state(ConnState::RelatedEstablished)
            .verdict(Verdict::Return),
        Rule::builder()
            .state(ConnState::New)
            .not_in_set(&SetName::local_pods(), Direction::Src)
            .verdict(Verdict::Return),
    ];
    if allow_multicast {
        rules.push(
            Rule::builder()
                .dst_net(multicast_net())
                .verdict(Verdict::Return),
        );
    }
    rules.extend([
        Rule::builder()
            .state(ConnState::New)
            .verdict(Verdict::Jump(Chain::EgressDefault)),
        Rule::builder()
            .state(ConnState::New)
            .not_marked(EGRESS_MARK)
            .verdict(Verdict::Jump(Chain::EgressCustom)),
        Rule::builder()
            .state(ConnState::New)
            .not_marked(EGRESS_MARK)
            .verdict(Verdict::Nflog(AUDIT_LOG_GROUP)),
        Rule::builder()
            .not_marked(EGRESS_MARK)
            .verdict(Verdict::Drop),
    ]);
    rules
}

/// Installs the static rule skeleton that routes traffic into the chains the
/// policy engine populates.
pub struct BaseRuleInstaller<'a> {
    backend: &'a dyn Backend,
    allow_multicast: bool,
    mode: ReconcileMode,
}

impl<'a> BaseRuleInstaller<'a> {
    pub fn new(backend: &'a dyn Backend, allow_multicast: bool) -> Self {
        Self {
            backend,
            allow_multicast,
            mode: ReconcileMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ReconcileMode) -> Self {
        self.mode = mode;
        self
    }

    /// Must run after a successful reset, which leaves the main and
    /// egress-mark chains empty.
    pub async fn install(&self, legacy: bool) -> Result<()> {
        info!(
            legacy,
            allow_multicast = self.allow_multicast,
            "Installing base rules"
        );

        let (head, tail) = main_rules(self.allow_multicast);
        self.append_all(Chain::Main, &head).await?;
        self.ensure_local_pods_set().await?;
        self.append(Chain::Main, &tail).await?;

        if legacy {
            return Ok(());
        }

        self.append_all(Chain::EgressMark, &egress_mark_rules())
            .await?;

        ChainReconciler::new(self.backend)
            .with_mode(self.mode)
            .ensure_chain(Table::Filter, Chain::Egress, &egress_rules(self.allow_multicast))
            .await
    }

    async fn ensure_local_pods_set(&self) -> Result<()> {
        let set = SetName::local_pods();
        if set_exists(self.backend, &set).await? {
            debug!(%set, "Set already exists");
            return Ok(());
        }

        debug!(%set, "Creating set");
        self.backend
            .create_set(&set, SetType::HashIp)
            .await
            .map_err(|e| Error::CreateSet {
                set: set.clone(),
                source: Box::new(e),
            })
    }

    async fn append_all(&self, chain: Chain, rules: &[Rule]) -> Result<()> {
        for rule in rules {
            self.append(chain, rule).await?;
        }
        Ok(())
    }

    async fn append(&self, chain: Chain, rule: &Rule) -> Result<()> {
        self.backend
            .append_rule(Table::Filter, chain, rule)
            .await
            .map_err(|e| Error::AppendRule {
                table: Table::Filter,
                chain,
                rule: rule.clone(),
                source: Box::new(e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::Bootstrapper;
    use crate::memory::{MemoryBackend, Op};

    fn rendered(rules: Option<Vec<Rule>>) -> Vec<String> {
        rules
            .unwrap_or_default()
            .iter()
            .map(Rule::render)
            .collect()
    }

    async fn bootstrap(backend: &MemoryBackend, allow_multicast: bool, legacy: bool) {
        Bootstrapper::new(backend).reset().await.unwrap();
        BaseRuleInstaller::new(backend, allow_multicast)
            .install(legacy)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn end_to_end_from_empty_state() {
        let backend = MemoryBackend::new();

        bootstrap(&backend, true, false).await;

        assert_eq!(
            rendered(backend.rules(Chain::Main)),
            vec![
                "-m state --state RELATED,ESTABLISHED -j ACCEPT",
                "-d 224.0.0.0/4 -j ACCEPT",
                "-m state --state NEW -j NETPOL-DEFAULT",
                "-m state --state NEW -j NETPOL-INGRESS",
                "-m set ! --match-set netpol-local-pods dst -j ACCEPT",
            ]
        );
        assert_eq!(
            rendered(backend.rules(Chain::Egress)),
            vec![
                "-m state --state RELATED,ESTABLISHED -j RETURN",
                "-m state --state NEW -m set ! --match-set netpol-local-pods src -j RETURN",
                "-d 224.0.0.0/4 -j RETURN",
                "-m state --state NEW -j NETPOL-EGRESS-DEFAULT",
                "-m state --state NEW -m mark ! --mark 0x40000/0x40000 -j NETPOL-EGRESS-CUSTOM",
                "-m state --state NEW -m mark ! --mark 0x40000/0x40000 -j NFLOG --nflog-group 86",
                "-m mark ! --mark 0x40000/0x40000 -j DROP",
            ]
        );
        assert_eq!(
            rendered(backend.rules(Chain::EgressMark)),
            vec!["-j MARK --set-xmark 0x40000/0x40000"]
        );
        assert_eq!(backend.entries(&SetName::local_pods()), Some(vec![]));
    }

    #[tokio::test]
    async fn multicast_rules_follow_the_flag() {
        let backend = MemoryBackend::new();

        bootstrap(&backend, false, false).await;

        let main = rendered(backend.rules(Chain::Main));
        let egress = rendered(backend.rules(Chain::Egress));
        assert_eq!(main.len(), 4);
        assert_eq!(egress.len(), 6);
        assert!(!main.iter().any(|r| r.contains("224.0.0.0/4")));
        assert!(!egress.iter().any(|r| r.contains("224.0.0.0/4")));
    }

    #[tokio::test]
    async fn legacy_skips_the_egress_pipeline() {
        let backend = MemoryBackend::new();

        bootstrap(&backend, true, true).await;

        assert_eq!(rendered(backend.rules(Chain::Main)).len(), 5);
        for chain in [Chain::EgressMark, Chain::EgressCustom, Chain::EgressDefault] {
            assert_eq!(backend.rules(chain), Some(vec![]));
        }
        assert_eq!(backend.rules(Chain::Egress), None);
    }

    #[tokio::test]
    async fn existing_local_pods_set_is_reused() {
        let backend = MemoryBackend::new();
        backend.insert_set(SetName::local_pods(), SetType::HashIp, ["10.32.0.2"]);

        bootstrap(&backend, true, false).await;

        assert_eq!(backend.calls(Op::CreateSet), 0);
        assert!(backend.has_set(&SetName::local_pods()));
    }

    #[tokio::test]
    async fn restart_leaves_egress_unchanged() {
        let backend = MemoryBackend::new();
        bootstrap(&backend, true, false).await;
        let first = backend.rules(Chain::Egress);

        backend.reset_calls();
        bootstrap(&backend, true, false).await;

        assert_eq!(backend.rules(Chain::Egress), first);
        assert_eq!(rendered(backend.rules(Chain::Main)).len(), 5);
        // Only main (5) and egress-mark (1) are appended again.
        assert_eq!(backend.calls(Op::AppendRule), 6);
    }

    #[tokio::test]
    async fn set_creation_failure_stops_before_the_set_rule() {
        let backend = MemoryBackend::new();
        backend.fail_on(Op::CreateSet);

        Bootstrapper::new(&backend).reset().await.unwrap();
        let err = BaseRuleInstaller::new(&backend, true)
            .install(false)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CreateSet { .. }));
        assert_eq!(rendered(backend.rules(Chain::Main)).len(), 4);
    }

    #[test]
    fn egress_sequence_lengths() {
        assert_eq!(egress_rules(true).len(), 7);
        assert_eq!(egress_rules(false).len(), 6);
        let (head, _) = main_rules(true);
        assert_eq!(head.len(), 4);
    }
}
