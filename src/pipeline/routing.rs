//! Route catalog and cost/tier-aware route selection.
//!
//! A route is one (provider, model) pair with a fixed per-request cost.
//! Selection never fails: when nothing fits, the cheapest catalog entry is
//! returned and the budget check at charge time decides whether it runs.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::analysis::QualityMetrics;
use super::budget::CostBudget;
use super::types::AccountTier;
use crate::config::{validate_routes, ConfigError, PipelineConfig};
use crate::providers::{ProviderKind, ProviderRegistry};

/// Static catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRoute {
    pub name: String,
    pub provider: ProviderKind,
    pub model: String,
    pub cost_per_request: f64,
    /// 0–1.
    pub expected_accuracy: f64,
    pub average_latency_ms: u64,
    #[serde(default)]
    pub description: String,
}

impl ProcessingRoute {
    pub fn new(name: &str, provider: ProviderKind, model: &str, cost: f64, accuracy: f64, latency_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            provider,
            model: model.to_string(),
            cost_per_request: cost,
            expected_accuracy: accuracy,
            average_latency_ms: latency_ms,
            description: String::new(),
        }
    }

    fn described(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

/// Routes ordered by ascending cost (stable for equal costs).
#[derive(Debug, Clone)]
pub struct RouteCatalog {
    routes: Vec<ProcessingRoute>,
}

impl RouteCatalog {
    pub fn new(mut routes: Vec<ProcessingRoute>) -> Result<Self, ConfigError> {
        validate_routes(&routes)?;
        routes.sort_by(|a, b| a.cost_per_request.total_cmp(&b.cost_per_request));
        Ok(Self { routes })
    }

    /// Default production table.
    pub fn builtin() -> Self {
        Self {
            routes: vec![
                ProcessingRoute::new("gemini-flash", ProviderKind::Gemini, "gemini-1.5-flash", 0.001, 0.85, 1800)
                    .described("Fast and cheap; clean single-column receipts"),
                ProcessingRoute::new("gpt-4o-mini", ProviderKind::OpenAi, "gpt-4o-mini", 0.003, 0.88, 2500)
                    .described("Balanced cost and accuracy"),
                ProcessingRoute::new(
                    "claude-sonnet",
                    ProviderKind::Anthropic,
                    "claude-3-5-sonnet-20241022",
                    0.012,
                    0.93,
                    4200,
                )
                .described("Strong layout reasoning; second opinion for fusion"),
                ProcessingRoute::new("gpt-4o", ProviderKind::OpenAi, "gpt-4o", 0.015, 0.95, 3800)
                    .described("Highest accuracy; dense or damaged receipts"),
            ],
        }
    }

    pub fn routes(&self) -> &[ProcessingRoute] {
        &self.routes
    }

    pub fn get(&self, name: &str) -> Option<&ProcessingRoute> {
        self.routes.iter().find(|r| r.name == name)
    }

    pub fn cheapest(&self) -> &ProcessingRoute {
        // Construction rejects empty catalogs.
        &self.routes[0]
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.routes.iter().position(|r| r.name == name)
    }
}

/// Chooses routes for one pipeline; borrows catalog and settings.
pub struct RouteSelector<'a> {
    catalog: &'a RouteCatalog,
    config: &'a PipelineConfig,
    registry: Option<&'a ProviderRegistry>,
}

impl<'a> RouteSelector<'a> {
    pub fn new(catalog: &'a RouteCatalog, config: &'a PipelineConfig) -> Self {
        Self {
            catalog,
            config,
            registry: None,
        }
    }

    /// Only consider routes whose provider is registered.
    pub fn with_registry(mut self, registry: &'a ProviderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn is_runnable(&self, route: &ProcessingRoute) -> bool {
        self.registry.map_or(true, |r| r.contains(route.provider))
    }

    pub fn tier_allows(&self, route: &ProcessingRoute, tier: AccountTier) -> bool {
        match self.config.tier_caps.cap_for(tier) {
            Some(cap) => route.cost_per_request <= cap + f64::EPSILON,
            None => true,
        }
    }

    /// Primary route for this image. Never fails.
    ///
    /// Among tier-allowed routes, affordable ones win when any exist. The
    /// preferred route for the complexity tier is taken if present; otherwise
    /// the next catalog entry after it, then the nearest one before it.
    pub fn select_route(&self, metrics: &QualityMetrics, tier: AccountTier, budget: &CostBudget) -> &'a ProcessingRoute {
        let catalog: &'a RouteCatalog = self.catalog;
        let allowed: Vec<usize> = (0..catalog.routes.len())
            .filter(|&i| self.is_runnable(&catalog.routes[i]))
            .filter(|&i| self.tier_allows(&catalog.routes[i], tier))
            .collect();
        let affordable: Vec<usize> = allowed
            .iter()
            .copied()
            .filter(|&i| budget.can_afford(&catalog.routes[i]))
            .collect();
        let pool = if affordable.is_empty() { &allowed } else { &affordable };

        let preferred_name = self.config.preferred_routes.for_tier(metrics.processing_route);
        let preferred = catalog.position(preferred_name).unwrap_or(0);

        let chosen = if pool.contains(&preferred) {
            Some(preferred)
        } else {
            pool.iter()
                .copied()
                .find(|&i| i > preferred)
                .or_else(|| pool.iter().copied().rev().find(|&i| i < preferred))
        };

        let route = match chosen {
            Some(i) => &catalog.routes[i],
            None => catalog.cheapest(),
        };
        debug!(
            route = %route.name,
            complexity = ?metrics.processing_route,
            tier = %tier,
            preferred = preferred_name,
            "Primary route selected"
        );
        route
    }

    /// Most accurate affordable, allowed, untried route. Ties go to the cheaper one.
    pub fn select_fallback(
        &self,
        tier: AccountTier,
        budget: &CostBudget,
        attempted: &[String],
    ) -> Option<&'a ProcessingRoute> {
        self.best_remaining(tier, budget, attempted, |_| true)
    }

    /// Like `select_fallback`, restricted to a different provider.
    pub fn select_secondary(
        &self,
        tier: AccountTier,
        budget: &CostBudget,
        exclude_provider: ProviderKind,
        attempted: &[String],
    ) -> Option<&'a ProcessingRoute> {
        self.best_remaining(tier, budget, attempted, |r| r.provider != exclude_provider)
    }

    fn best_remaining(
        &self,
        tier: AccountTier,
        budget: &CostBudget,
        attempted: &[String],
        extra: impl Fn(&ProcessingRoute) -> bool,
    ) -> Option<&'a ProcessingRoute> {
        let catalog: &'a RouteCatalog = self.catalog;
        catalog
            .routes
            .iter()
            .filter(|r| !attempted.iter().any(|a| a == &r.name))
            .filter(|r| self.is_runnable(r))
            .filter(|r| self.tier_allows(r, tier))
            .filter(|r| budget.can_afford(r))
            .filter(|r| extra(r))
            .min_by(|a, b| {
                b.expected_accuracy
                    .total_cmp(&a.expected_accuracy)
                    .then(a.cost_per_request.total_cmp(&b.cost_per_request))
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::providers::MockProvider;

    fn simple() -> QualityMetrics {
        QualityMetrics::from_scores(80.0, 75.0, 50.0, 15.0)
    }

    fn standard() -> QualityMetrics {
        QualityMetrics::from_scores(60.0, 60.0, 50.0, 40.0)
    }

    fn complex() -> QualityMetrics {
        QualityMetrics::from_scores(20.0, 20.0, 10.0, 90.0)
    }

    fn names(attempted: &[&str]) -> Vec<String> {
        attempted.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fixture_metrics_have_expected_tiers() {
        use crate::pipeline::types::ComplexityTier;
        assert_eq!(simple().processing_route, ComplexityTier::Simple);
        assert_eq!(standard().processing_route, ComplexityTier::Standard);
        assert_eq!(complex().processing_route, ComplexityTier::Complex);
    }

    #[test]
    fn builtin_catalog_sorted_by_cost() {
        let catalog = RouteCatalog::builtin();
        let costs: Vec<f64> = catalog.routes().iter().map(|r| r.cost_per_request).collect();
        assert!(costs.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(catalog.cheapest().name, "gemini-flash");
    }

    #[test]
    fn new_sorts_and_validates() {
        let catalog = RouteCatalog::new(vec![
            ProcessingRoute::new("b", ProviderKind::OpenAi, "m", 0.02, 0.9, 1),
            ProcessingRoute::new("a", ProviderKind::Gemini, "m", 0.01, 0.8, 1),
        ])
        .unwrap();
        assert_eq!(catalog.cheapest().name, "a");
        assert!(RouteCatalog::new(vec![]).is_err());
    }

    #[test]
    fn simple_image_gets_cheapest_route() {
        let catalog = RouteCatalog::builtin();
        let config = PipelineConfig::default();
        let budget = CostBudget::new(10.0);
        let selector = RouteSelector::new(&catalog, &config);

        for tier in [AccountTier::Free, AccountTier::Pro, AccountTier::Enterprise] {
            assert_eq!(selector.select_route(&simple(), tier, &budget).name, "gemini-flash");
        }
    }

    #[test]
    fn standard_route_per_tier() {
        let catalog = RouteCatalog::builtin();
        let config = PipelineConfig::default();
        let budget = CostBudget::new(10.0);
        let selector = RouteSelector::new(&catalog, &config);

        assert_eq!(selector.select_route(&standard(), AccountTier::Pro, &budget).name, "gpt-4o-mini");
        // Free cannot use gpt-4o-mini; nothing allowed after it, so the nearest earlier entry.
        assert_eq!(selector.select_route(&standard(), AccountTier::Free, &budget).name, "gemini-flash");
    }

    #[test]
    fn complex_route_falls_back_within_tier_cap() {
        let catalog = RouteCatalog::builtin();
        let config = PipelineConfig::default();
        let budget = CostBudget::new(10.0);
        let selector = RouteSelector::new(&catalog, &config);

        assert_eq!(selector.select_route(&complex(), AccountTier::Enterprise, &budget).name, "gpt-4o");
        assert_eq!(selector.select_route(&complex(), AccountTier::Pro, &budget).name, "gpt-4o-mini");
    }

    #[test]
    fn unknown_preferred_route_takes_next_allowed_entry() {
        let catalog = RouteCatalog::builtin();
        let mut config = PipelineConfig::default();
        config.preferred_routes.simple = "retired-route".into();
        let budget = CostBudget::new(10.0);
        let selector = RouteSelector::new(&catalog, &config);

        // Unknown name resolves to position 0, which is allowed.
        assert_eq!(selector.select_route(&simple(), AccountTier::Enterprise, &budget).name, "gemini-flash");
    }

    #[test]
    fn affordable_route_preferred_over_unaffordable() {
        let catalog = RouteCatalog::builtin();
        let config = PipelineConfig::default();
        let budget = CostBudget::new(0.002);
        let selector = RouteSelector::new(&catalog, &config);

        assert_eq!(selector.select_route(&complex(), AccountTier::Enterprise, &budget).name, "gemini-flash");
    }

    #[test]
    fn exhausted_budget_still_returns_a_route() {
        let catalog = RouteCatalog::builtin();
        let config = PipelineConfig::default();
        let budget = CostBudget::new(0.0);
        let selector = RouteSelector::new(&catalog, &config);

        let route = selector.select_route(&simple(), AccountTier::Free, &budget);
        assert_eq!(route.name, "gemini-flash");
        assert!(!budget.can_afford(route));
    }

    #[test]
    fn tier_with_no_allowed_routes_gets_cheapest() {
        let catalog = RouteCatalog::builtin();
        let mut config = PipelineConfig::default();
        config.tier_caps.free = Some(0.0001);
        let budget = CostBudget::new(10.0);
        let selector = RouteSelector::new(&catalog, &config);

        assert_eq!(selector.select_route(&complex(), AccountTier::Free, &budget).name, "gemini-flash");
    }

    #[test]
    fn fallback_prefers_accuracy_and_skips_attempted() {
        let catalog = RouteCatalog::builtin();
        let config = PipelineConfig::default();
        let budget = CostBudget::new(10.0);
        let selector = RouteSelector::new(&catalog, &config);

        let fb = selector.select_fallback(AccountTier::Enterprise, &budget, &names(&["gpt-4o"]));
        assert_eq!(fb.unwrap().name, "claude-sonnet");

        let fb = selector.select_fallback(AccountTier::Pro, &budget, &names(&["gpt-4o-mini"]));
        assert_eq!(fb.unwrap().name, "gemini-flash");

        assert!(selector.select_fallback(AccountTier::Free, &budget, &names(&["gemini-flash"])).is_none());
    }

    #[test]
    fn fallback_requires_affordability() {
        let catalog = RouteCatalog::builtin();
        let config = PipelineConfig::default();
        let budget = CostBudget::new(0.005);
        let selector = RouteSelector::new(&catalog, &config);

        let fb = selector.select_fallback(AccountTier::Enterprise, &budget, &names(&["gemini-flash"]));
        assert_eq!(fb.unwrap().name, "gpt-4o-mini");
    }

    #[test]
    fn fallback_accuracy_tie_goes_to_cheaper() {
        let catalog = RouteCatalog::new(vec![
            ProcessingRoute::new("pricey", ProviderKind::OpenAi, "m", 0.02, 0.9, 1),
            ProcessingRoute::new("thrifty", ProviderKind::Anthropic, "m", 0.01, 0.9, 1),
            ProcessingRoute::new("weak", ProviderKind::Gemini, "m", 0.001, 0.5, 1),
        ])
        .unwrap();
        let config = PipelineConfig::default();
        let budget = CostBudget::new(10.0);
        let selector = RouteSelector::new(&catalog, &config);

        let fb = selector.select_fallback(AccountTier::Enterprise, &budget, &names(&["weak"]));
        assert_eq!(fb.unwrap().name, "thrifty");
    }

    #[test]
    fn secondary_uses_a_different_provider() {
        let catalog = RouteCatalog::builtin();
        let config = PipelineConfig::default();
        let budget = CostBudget::new(10.0);
        let selector = RouteSelector::new(&catalog, &config);

        let second = selector
            .select_secondary(AccountTier::Enterprise, &budget, ProviderKind::OpenAi, &names(&["gpt-4o"]))
            .unwrap();
        assert_eq!(second.name, "claude-sonnet");

        let second = selector
            .select_secondary(AccountTier::Pro, &budget, ProviderKind::OpenAi, &names(&["gpt-4o-mini"]))
            .unwrap();
        assert_eq!(second.provider, ProviderKind::Gemini);

        assert!(selector
            .select_secondary(AccountTier::Free, &budget, ProviderKind::Gemini, &names(&["gemini-flash"]))
            .is_none());
    }

    fn gemini_only() -> ProviderRegistry {
        ProviderRegistry::new().with(Arc::new(MockProvider::new(ProviderKind::Gemini, "{}")))
    }

    #[test]
    fn unregistered_providers_are_never_selected() {
        let catalog = RouteCatalog::builtin();
        let config = PipelineConfig::default();
        let budget = CostBudget::new(10.0);
        let registry = gemini_only();
        let selector = RouteSelector::new(&catalog, &config).with_registry(&registry);

        assert_eq!(selector.select_route(&standard(), AccountTier::Pro, &budget).name, "gemini-flash");
        assert_eq!(selector.select_route(&complex(), AccountTier::Enterprise, &budget).name, "gemini-flash");
        assert!(selector
            .select_fallback(AccountTier::Enterprise, &budget, &names(&["gemini-flash"]))
            .is_none());
        assert!(selector
            .select_secondary(AccountTier::Enterprise, &budget, ProviderKind::OpenAi, &names(&["gpt-4o"]))
            .is_some_and(|r| r.provider == ProviderKind::Gemini));
    }

    #[test]
    fn selector_without_registry_considers_every_route() {
        let catalog = RouteCatalog::builtin();
        let config = PipelineConfig::default();
        let selector = RouteSelector::new(&catalog, &config);
        assert!(catalog.routes().iter().all(|r| selector.is_runnable(r)));

        let registry = gemini_only();
        let selector = selector.with_registry(&registry);
        assert!(!selector.is_runnable(catalog.get("gpt-4o").unwrap()));
    }
}
