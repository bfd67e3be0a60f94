// iptables rule vocabulary shared by the bootstrapper, installer and engine
use crate::set::SetName;
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;

/// Mark set on packets that already received an egress verdict.
pub const EGRESS_MARK: Mark = Mark {
    value: 0x40000,
    mask: 0x40000,
};

/// NFLOG group used for the egress audit trail.
pub const AUDIT_LOG_GROUP: u16 = 86;

pub fn multicast_net() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(224, 0, 0, 0), 4).expect("4 is a valid IPv4 prefix length")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Filter,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed set of chains owned by this system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Chain {
    Main,
    Ingress,
    Default,
    EgressMark,
    EgressCustom,
    EgressDefault,
    Egress,
}

impl Chain {
    pub const ALL: [Chain; 7] = [
        Chain::Main,
        Chain::Ingress,
        Chain::Default,
        Chain::EgressMark,
        Chain::EgressCustom,
        Chain::EgressDefault,
        Chain::Egress,
    ];

    /// Chains emptied on startup, in order. Egress is absent: emptying it
    /// would let all egress traffic through until it is rebuilt.
    pub const RESET_ORDER: [Chain; 6] = [
        Chain::Ingress,
        Chain::Default,
        Chain::Main,
        Chain::EgressMark,
        Chain::EgressCustom,
        Chain::EgressDefault,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Chain::Main => "NETPOL",
            Chain::Ingress => "NETPOL-INGRESS",
            Chain::Default => "NETPOL-DEFAULT",
            Chain::EgressMark => "NETPOL-EGRESS-MARK",
            Chain::EgressCustom => "NETPOL-EGRESS-CUSTOM",
            Chain::EgressDefault => "NETPOL-EGRESS-DEFAULT",
            Chain::Egress => "NETPOL-EGRESS",
        }
    }

    pub fn from_name(name: &str) -> Option<Chain> {
        Chain::ALL.into_iter().find(|chain| chain.name() == name)
    }

    /// Dynamic chains are populated by the policy engine, static ones by the
    /// base rule installer.
    pub fn is_dynamic(&self) -> bool {
        matches!(
            self,
            Chain::Ingress | Chain::Default | Chain::EgressCustom | Chain::EgressDefault
        )
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mark {
    pub value: u32,
    pub mask: u32,
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{:#x}", self.value, self.mask)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    RelatedEstablished,
}

impl ConnState {
    fn as_str(&self) -> &'static str {
        match self {
            ConnState::New => "NEW",
            ConnState::RelatedEstablished => "RELATED,ESTABLISHED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Src,
    Dst,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Src => "src",
            Direction::Dst => "dst",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
    Return,
    Jump(Chain),
    SetMark(Mark),
    Nflog(u16),
}

impl Verdict {
    fn tokens(&self) -> Vec<String> {
        match self {
            Verdict::Accept => vec!["-j".into(), "ACCEPT".into()],
            Verdict::Drop => vec!["-j".into(), "DROP".into()],
            Verdict::Return => vec!["-j".into(), "RETURN".into()],
            Verdict::Jump(chain) => vec!["-j".into(), chain.name().into()],
            Verdict::SetMark(mark) => vec![
                "-j".into(),
                "MARK".into(),
                "--set-xmark".into(),
                mark.to_string(),
            ],
            Verdict::Nflog(group) => vec![
                "-j".into(),
                "NFLOG".into(),
                "--nflog-group".into(),
                group.to_string(),
            ],
        }
    }
}

/// A rule as the exact token sequence `iptables -S` prints after `-A <chain>`.
///
/// Equality is token-for-token, so a rule built here compares equal to the
/// same rule read back from the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    tokens: Vec<String>,
}

impl Rule {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a rule spec into tokens, honoring double quotes.
    pub fn parse(spec: &str) -> Self {
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut quoted = false;
        let mut in_token = false;

        for ch in spec.chars() {
            match ch {
                '"' => {
                    quoted = !quoted;
                    in_token = true;
                }
                c if c.is_whitespace() && !quoted => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            }
        }
        if in_token {
            tokens.push(current);
        }

        Self { tokens }
    }

    pub fn builder() -> RuleBuilder {
        RuleBuilder::default()
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn render(&self) -> String {
        self.tokens.join(" ")
    }

    /// Named sets this rule matches against.
    pub fn referenced_sets(&self) -> impl Iterator<Item = &str> {
        self.tokens
            .windows(2)
            .filter(|pair| pair[0] == "--match-set")
            .map(|pair| pair[1].as_str())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Builds rules in the canonical order `iptables -S` prints them: address
/// matches first, then match modules in the order given, then the target.
#[derive(Debug, Default, Clone)]
pub struct RuleBuilder {
    addresses: Vec<String>,
    matches: Vec<String>,
}

impl RuleBuilder {
    pub fn dst_net(mut self, net: Ipv4Net) -> Self {
        self.addresses.extend(["-d".to_string(), net.to_string()]);
        self
    }

    pub fn state(mut self, state: ConnState) -> Self {
        self.matches.extend(
            ["-m", "state", "--state", state.as_str()]
                .into_iter()
                .map(String::from),
        );
        self
    }

    pub fn in_set(self, set: &SetName, direction: Direction) -> Self {
        self.match_set(set, direction, false)
    }

    pub fn not_in_set(self, set: &SetName, direction: Direction) -> Self {
        self.match_set(set, direction, true)
    }

    fn match_set(mut self, set: &SetName, direction: Direction, negate: bool) -> Self {
        self.matches.extend(["-m".to_string(), "set".to_string()]);
        if negate {
            self.matches.push("!".into());
        }
        self.matches.extend([
            "--match-set".to_string(),
            set.to_string(),
            direction.as_str().to_string(),
        ]);
        self
    }

    pub fn not_marked(mut self, mark: Mark) -> Self {
        self.matches.extend([
            "-m".to_string(),
            "mark".to_string(),
            "!".to_string(),
            "--mark".to_string(),
            mark.to_string(),
        ]);
        self
    }

    pub fn verdict(self, verdict: Verdict) -> Rule {
        let mut tokens = self.addresses;
        tokens.extend(self.matches);
        tokens.extend(verdict.tokens());
        Rule { tokens }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_renders_iptables_save_order() {
        let rule = Rule::builder()
            .state(ConnState::New)
            .not_in_set(&SetName::local_pods(), Direction::Src)
            .verdict(Verdict::Return);

        assert_eq!(
            rule.render(),
            "-m state --state NEW -m set ! --match-set netpol-local-pods src -j RETURN"
        );
    }

    #[test]
    fn mark_and_nflog_targets() {
        let mark = Rule::builder().verdict(Verdict::SetMark(EGRESS_MARK));
        assert_eq!(mark.render(), "-j MARK --set-xmark 0x40000/0x40000");

        let log = Rule::builder()
            .state(ConnState::New)
            .not_marked(EGRESS_MARK)
            .verdict(Verdict::Nflog(AUDIT_LOG_GROUP));
        assert_eq!(
            log.render(),
            "-m state --state NEW -m mark ! --mark 0x40000/0x40000 -j NFLOG --nflog-group 86"
        );
    }

    #[test]
    fn multicast_destination() {
        let rule = Rule::builder()
            .dst_net(multicast_net())
            .verdict(Verdict::Accept);
        assert_eq!(rule.render(), "-d 224.0.0.0/4 -j ACCEPT");
    }

    #[test]
    fn parse_matches_builder() {
        let built = Rule::builder()
            .state(ConnState::RelatedEstablished)
            .verdict(Verdict::Accept);
        let parsed = Rule::parse("-m state --state RELATED,ESTABLISHED  -j ACCEPT");
        assert_eq!(built, parsed);
    }

    #[test]
    fn parse_keeps_quoted_comment_as_one_token() {
        let rule = Rule::parse(r#"-m comment --comment "allow dns" -j ACCEPT"#);
        assert_eq!(
            rule.tokens(),
            &["-m", "comment", "--comment", "allow dns", "-j", "ACCEPT"]
        );
    }

    #[test]
    fn referenced_sets_lists_match_targets() {
        let rule = Rule::builder()
            .in_set(&SetName::new("netpol-a").unwrap(), Direction::Src)
            .not_in_set(&SetName::new("netpol-b").unwrap(), Direction::Dst)
            .verdict(Verdict::Accept);
        let sets: Vec<_> = rule.referenced_sets().collect();
        assert_eq!(sets, vec!["netpol-a", "netpol-b"]);
    }

    #[test]
    fn chain_names_round_trip() {
        for chain in Chain::ALL {
            assert_eq!(Chain::from_name(chain.name()), Some(chain));
            assert!(chain.name().len() <= 28);
        }
        assert!(!Chain::RESET_ORDER.contains(&Chain::Egress));
    }
}
