use crate::rule::Chain;
use crate::set::SetName;

#[derive(Debug, Clone, Default)]
pub struct FilterStatus {
    pub chains: Vec<ChainStatus>,
    pub sets: Vec<SetStatus>,
}

#[derive(Debug, Clone)]
pub struct ChainStatus {
    pub chain: Chain,
    pub exists: bool,
    pub rules: usize,
}

#[derive(Debug, Clone)]
pub struct SetStatus {
    pub name: SetName,
    pub entries: usize,
}

impl FilterStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule_count(&self, chain: Chain) -> Option<usize> {
        self.chains
            .iter()
            .find(|status| status.chain == chain && status.exists)
            .map(|status| status.rules)
    }

    pub fn display(&self) {
        println!("📊 Filter Status\n");

        println!("🔗 Chains ({}):", self.chains.len());
        for status in &self.chains {
            let kind = if status.chain.is_dynamic() {
                "dynamic"
            } else {
                "static"
            };
            if status.exists {
                println!("  • {} [{}] - {} rules", status.chain, kind, status.rules);
            } else {
                println!("  • {} [{}] - missing", status.chain, kind);
            }
        }

        println!("\n📦 Sets ({}):", self.sets.len());
        if self.sets.is_empty() {
            println!("  (none)");
        } else {
            for set in &self.sets {
                println!("  • {} - {} entries", set.name, set.entries);
            }
        }
    }
}
