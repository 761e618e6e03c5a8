//! Agent definitions
//!
//! The agent set is built once at startup (built-in roster or a JSON file)
//! and shared read-only afterwards.

use crate::error::OrchestrationError;
use crate::tools::catalog::{
    self, BRAVE_SEARCH, DUCKDUCKGO, IBKR, NEO4J_CYPHER, PYTHON_INTERPRETER, QUANT_OPTIMIZATION,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const FALLBACK_AGENT: &str = "financial_analyst";

/// One weighted routing cue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cue {
    pub term: String,
    pub weight: u32,
}

impl Cue {
    pub fn new(term: &str, weight: u32) -> Self {
        Self {
            term: term.to_lowercase(),
            weight,
        }
    }
}

/// Declarative routing descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DomainProfile {
    #[serde(default)]
    pub cues: Vec<Cue>,
    /// Tie-break order, lower wins
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Added once when the request mentions an uppercase ticker
    #[serde(default)]
    pub symbol_bonus: u32,
}

fn default_priority() -> u32 {
    100
}

fn default_temperature() -> f32 {
    0.3
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub instruction: String,
    /// Allow-list of capability ids, in declaration order
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub human_input: bool,
    #[serde(default)]
    pub domain: DomainProfile,
}

impl AgentDefinition {
    pub fn allows(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Immutable, ordered set of agents plus the routing fallback
#[derive(Debug, Clone)]
pub struct AgentSet {
    agents: Vec<AgentDefinition>,
    index: HashMap<String, usize>,
    fallback: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentFile {
    #[serde(default)]
    fallback: Option<String>,
    agents: Vec<AgentDefinition>,
}

impl AgentSet {
    pub fn new(mut agents: Vec<AgentDefinition>, fallback: Option<String>) -> crate::Result<Self> {
        if agents.is_empty() {
            return Err(OrchestrationError::ConfigError(
                "Agent set is empty".to_string(),
            ));
        }

        // request tokens are matched lowercased
        for cue in agents.iter_mut().flat_map(|a| a.domain.cues.iter_mut()) {
            cue.term = cue.term.trim().to_lowercase();
        }

        let mut index = HashMap::with_capacity(agents.len());
        for (i, agent) in agents.iter().enumerate() {
            if agent.name.trim().is_empty() {
                return Err(OrchestrationError::ConfigError(
                    "Agent name must not be empty".to_string(),
                ));
            }
            if index.insert(agent.name.clone(), i).is_some() {
                return Err(OrchestrationError::ConfigError(format!(
                    "Duplicate agent name: {}",
                    agent.name
                )));
            }
            let mut seen = HashSet::new();
            if let Some(dup) = agent.capabilities.iter().find(|c| !seen.insert(c.as_str())) {
                return Err(OrchestrationError::ConfigError(format!(
                    "Agent {} lists capability {} twice",
                    agent.name, dup
                )));
            }
        }

        if let Some(name) = &fallback {
            if !index.contains_key(name) {
                return Err(OrchestrationError::ConfigError(format!(
                    "Fallback agent {} is not defined",
                    name
                )));
            }
        }

        Ok(Self {
            agents,
            index,
            fallback,
        })
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        let file: AgentFile = serde_json::from_str(json)?;
        Self::new(file.agents, file.fallback)
    }

    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    pub fn get(&self, name: &str) -> Option<&AgentDefinition> {
        self.index.get(name).map(|&i| &self.agents[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn fallback(&self) -> Option<&AgentDefinition> {
        self.fallback.as_deref().and_then(|name| self.get(name))
    }

    /// Apply a transformation to every agent (used for config overrides)
    pub fn map_agents(self, f: impl Fn(AgentDefinition) -> AgentDefinition) -> Self {
        let agents = self.agents.into_iter().map(f).collect();
        Self {
            agents,
            index: self.index,
            fallback: self.fallback,
        }
    }
}

fn cues(terms: &[(&str, u32)]) -> Vec<Cue> {
    terms.iter().map(|(t, w)| Cue::new(t, *w)).collect()
}

/// Built-in financial roster
pub fn default_agents() -> AgentSet {
    let agents = vec![
        AgentDefinition {
            name: "financial_analyst".to_string(),
            description: "Market analysis and insights".to_string(),
            instruction: "You are a professional financial analyst with access to Interactive Brokers data and web search.\n\
                Analyze market data, stock performance, and provide detailed financial insights.\n\
                You can search the web for additional market information, news, and research.\n\
                Focus on:\n\
                - Stock price analysis and trends\n\
                - Market volatility assessment\n\
                - Sector performance comparison\n\
                - Risk analysis and recommendations".to_string(),
            capabilities: catalog::capability_ids(&[IBKR, BRAVE_SEARCH]),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.3,
            human_input: true,
            domain: DomainProfile {
                cues: cues(&[
                    ("stock", 1),
                    ("market", 1),
                    ("price", 1),
                    ("analysis", 2),
                    ("analyze", 2),
                    ("volatility", 2),
                    ("sector", 2),
                    ("trend", 2),
                    ("earnings", 2),
                    ("valuation", 2),
                    ("outlook", 2),
                    ("risk", 1),
                ]),
                priority: 6,
                symbol_bonus: 1,
            },
        },
        AgentDefinition {
            name: "portfolio_manager".to_string(),
            description: "Portfolio optimization and management".to_string(),
            instruction: "You are a portfolio manager with access to Interactive Brokers trading capabilities and web search.\n\
                You can search for market research and additional information to inform decisions.\n\
                Manage portfolios by:\n\
                - Analyzing current positions\n\
                - Suggesting rebalancing strategies\n\
                - Calculating risk metrics\n\
                - Generating performance reports\n\
                - Recommending buy/sell actions".to_string(),
            capabilities: catalog::capability_ids(&[IBKR, BRAVE_SEARCH, QUANT_OPTIMIZATION]),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.2,
            human_input: false,
            domain: DomainProfile {
                cues: cues(&[
                    ("portfolio", 3),
                    ("rebalance", 3),
                    ("rebalancing", 3),
                    ("holdings", 3),
                    ("allocation", 3),
                    ("diversify", 2),
                    ("diversification", 2),
                    ("positions", 2),
                    ("performance report", 3),
                    ("risk metrics", 2),
                ]),
                priority: 2,
                symbol_bonus: 0,
            },
        },
        AgentDefinition {
            name: "trading_advisor".to_string(),
            description: "Trading recommendations and strategies".to_string(),
            instruction: "Provide trading recommendations based on IBKR market data and web research.\n\
                You can search for breaking news and market information to inform trading decisions.\n\
                Include:\n\
                - Entry and exit points\n\
                - Position sizing recommendations\n\
                - Stop-loss and take-profit levels\n\
                - Market timing analysis\n\
                - Trade execution strategies".to_string(),
            capabilities: catalog::capability_ids(&[IBKR, BRAVE_SEARCH]),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.25,
            human_input: true,
            domain: DomainProfile {
                cues: cues(&[
                    ("buy", 3),
                    ("sell", 3),
                    ("short", 2),
                    ("entry", 2),
                    ("exit", 2),
                    ("stop loss", 3),
                    ("stop-loss", 3),
                    ("take profit", 3),
                    ("take-profit", 3),
                    ("trade", 2),
                    ("trading", 2),
                    ("position sizing", 3),
                    ("order", 2),
                    ("timing", 2),
                    ("right now", 1),
                ]),
                priority: 3,
                symbol_bonus: 1,
            },
        },
        AgentDefinition {
            name: "python_analyst".to_string(),
            description: "Python-powered quantitative analysis".to_string(),
            instruction: "You are a Python-powered quantitative analyst with access to Python execution, IBKR data, and web search.\n\
                Use Python to perform advanced financial calculations, data analysis, and create visualizations.\n\
                Your capabilities include:\n\
                - Running Python code for financial calculations and analysis\n\
                - Creating charts and visualizations with matplotlib/seaborn\n\
                - Statistical analysis and backtesting with pandas/numpy\n\
                - Risk metrics calculation and portfolio optimization\n\
                - Technical indicator development and testing\n\
                Always show your Python code and explain your analytical approach.".to_string(),
            capabilities: catalog::capability_ids(&[PYTHON_INTERPRETER, IBKR, BRAVE_SEARCH]),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.2,
            human_input: true,
            domain: DomainProfile {
                cues: cues(&[
                    ("python", 4),
                    ("code", 2),
                    ("script", 2),
                    ("backtest", 3),
                    ("simulate", 3),
                    ("simulation", 3),
                    ("monte carlo", 3),
                    ("chart", 2),
                    ("plot", 2),
                    ("visualize", 2),
                    ("visualization", 2),
                    ("regression", 2),
                    ("indicator", 2),
                    ("pandas", 3),
                    ("numpy", 3),
                    ("calculate", 1),
                ]),
                priority: 1,
                symbol_bonus: 0,
            },
        },
        AgentDefinition {
            name: "neo4j_analyst".to_string(),
            description: "Graph analysis of market relationships".to_string(),
            instruction: "You are a graph database analyst with access to Neo4j for relationship analysis and network insights.\n\
                Use Neo4j to analyze complex relationships in financial data, market networks, and portfolio connections.\n\
                Your capabilities include:\n\
                - Creating and querying graph databases for financial networks\n\
                - Analyzing relationships between stocks, sectors, and market participants\n\
                - Identifying patterns and clusters in financial data\n\
                - Building knowledge graphs for investment research\n\
                - Performing graph-based risk analysis and correlation studies\n\
                Always explain your Cypher queries and the insights they reveal.".to_string(),
            capabilities: catalog::capability_ids(&[NEO4J_CYPHER, IBKR, DUCKDUCKGO]),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.2,
            human_input: true,
            domain: DomainProfile {
                cues: cues(&[
                    ("neo4j", 5),
                    ("cypher", 4),
                    ("graph", 3),
                    ("knowledge graph", 3),
                    ("relationship", 2),
                    ("network", 2),
                    ("cluster", 2),
                    ("connected", 1),
                    ("correlation", 1),
                ]),
                priority: 4,
                symbol_bonus: 0,
            },
        },
        AgentDefinition {
            name: "research_analyst".to_string(),
            description: "Multi-source market research".to_string(),
            instruction: "You are a financial research analyst with access to comprehensive search capabilities and graph analysis.\n\
                Combine web search, graph database insights, and market data for deep research.\n\
                Your capabilities include:\n\
                - Conducting thorough market research using DuckDuckGo search\n\
                - Analyzing company relationships and market networks via Neo4j\n\
                - Cross-referencing multiple data sources for comprehensive analysis\n\
                - Building research reports with interconnected insights\n\
                - Identifying market trends and emerging patterns\n\
                Focus on providing well-researched, multi-source insights with clear citations.".to_string(),
            capabilities: catalog::capability_ids(&[DUCKDUCKGO, NEO4J_CYPHER, IBKR]),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.3,
            human_input: true,
            domain: DomainProfile {
                cues: cues(&[
                    ("research", 3),
                    ("news", 2),
                    ("sources", 2),
                    ("citation", 2),
                    ("competitor", 2),
                    ("industry", 2),
                    ("emerging", 2),
                    ("deep dive", 3),
                    ("investigate", 2),
                ]),
                priority: 5,
                symbol_bonus: 0,
            },
        },
    ];

    let index = agents
        .iter()
        .enumerate()
        .map(|(i, a)| (a.name.clone(), i))
        .collect();

    AgentSet {
        agents,
        index,
        fallback: Some(FALLBACK_AGENT.to_string()),
    }
}
