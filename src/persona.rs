//! Personality model and respond/no-respond decisions.
//!
//! The engine keeps a trait table and per-contact relationship profiles, and
//! computes both a response probability and a structured voice (style, trait
//! weights, guidelines, example phrases) for every inbound message. The
//! random draw sits behind [`RandomSource`] so the decision is a pure
//! function of its inputs under a fixed source.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseLength {
    Short,
    Medium,
    Long,
}

/// Tone and shape applied to generated replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationStyle {
    pub formality: f32,
    pub emoji_usage: f32,
    pub humor_level: f32,
    pub technical_depth: f32,
    pub response_length: ResponseLength,
}

impl Default for CommunicationStyle {
    fn default() -> Self {
        Self {
            formality: 0.5,
            emoji_usage: 0.3,
            humor_level: 0.4,
            technical_depth: 0.6,
            response_length: ResponseLength::Medium,
        }
    }
}

/// A named behavioral tendency with a base weight, sample phrases and the
/// contexts it is most active in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaTrait {
    pub name: String,
    pub weight: f32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub contexts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    Family,
    Friend,
    Colleague,
    Professional,
    Unknown,
}

/// Per-contact overrides: how close the contact is, optional style override
/// and trait adjustments in [-1, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipProfile {
    pub contact: String,
    pub kind: RelationshipKind,
    pub closeness: f32,
    #[serde(default)]
    pub style_override: Option<CommunicationStyle>,
    #[serde(default)]
    pub trait_adjustments: HashMap<String, f32>,
    #[serde(default)]
    pub last_interaction: Option<DateTime<Utc>>,
    #[serde(default)]
    pub interaction_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Received,
    Sent,
}

/// Everything the generator needs to speak in the persona's voice for one
/// particular contact. Recomputed per decision, never cached.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionContext {
    pub style: CommunicationStyle,
    pub relationship_kind: RelationshipKind,
    pub closeness: f32,
    pub active_traits: BTreeMap<String, f32>,
    pub guidelines: Vec<String>,
    pub examples: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub should_respond: bool,
    pub probability: f32,
    pub context: DecisionContext,
}

/// Inclusive time-of-day window in which responses are not penalized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ActiveHours {
    pub fn parse(start: &str, end: &str) -> Option<Self> {
        let start = NaiveTime::parse_from_str(start, "%H:%M").ok()?;
        let end = NaiveTime::parse_from_str(end, "%H:%M").ok()?;
        Some(Self { start, end })
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        self.start <= time && time <= self.end
    }
}

impl Default for ActiveHours {
    fn default() -> Self {
        Self::parse("08:00", "22:00").expect("static active-hours literals")
    }
}

/// Uniform draw in [0, 1). Injected so decisions are deterministic in tests.
pub trait RandomSource: Send {
    fn draw(&mut self) -> f64;
}

/// Production source seeded from OS entropy.
pub struct EntropyRandom(StdRng);

impl EntropyRandom {
    pub fn new() -> Self {
        Self(StdRng::from_entropy())
    }
}

impl Default for EntropyRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomSource for EntropyRandom {
    fn draw(&mut self) -> f64 {
        self.0.gen()
    }
}

/// Always returns the same value. Useful for deterministic tests.
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn draw(&mut self) -> f64 {
        self.0
    }
}

pub struct DecisionEngine {
    base_style: CommunicationStyle,
    base_probability: f32,
    trigger_words: Vec<String>,
    active_hours: ActiveHours,
    traits: RwLock<HashMap<String, PersonaTrait>>,
    relationships: RwLock<HashMap<String, RelationshipProfile>>,
    rng: Mutex<Box<dyn RandomSource>>,
}

/// Snapshot of the configured personality, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PersonaSummary {
    pub traits: BTreeMap<String, f32>,
    pub style: CommunicationStyle,
    pub relationship_count: usize,
    pub base_probability: f32,
}

const UNIVERSAL_GUIDELINES: [&str; 3] = [
    "Maintain consistency with established personality",
    "Be authentic and natural in responses",
    "Consider the relationship context and history",
];

impl DecisionEngine {
    pub fn new(
        base_style: CommunicationStyle,
        base_probability: f32,
        trigger_words: Vec<String>,
        active_hours: ActiveHours,
        rng: Box<dyn RandomSource>,
    ) -> Self {
        let trigger_words = trigger_words
            .into_iter()
            .map(|word| word.to_lowercase())
            .collect();
        Self {
            base_style,
            base_probability,
            trigger_words,
            active_hours,
            traits: RwLock::new(HashMap::new()),
            relationships: RwLock::new(HashMap::new()),
            rng: Mutex::new(rng),
        }
    }

    /// Installs the stock trait table. Used when the config carries none.
    pub async fn install_default_traits(&self) {
        for persona_trait in default_traits() {
            self.register_trait(persona_trait).await;
        }
    }

    pub async fn register_trait(&self, persona_trait: PersonaTrait) {
        tracing::info!("Registered persona trait: {}", persona_trait.name);
        self.traits
            .write()
            .await
            .insert(persona_trait.name.clone(), persona_trait);
    }

    pub async fn register_relationship(&self, profile: RelationshipProfile) {
        tracing::info!("Registered relationship profile for: {}", profile.contact);
        self.relationships
            .write()
            .await
            .insert(profile.contact.clone(), profile);
    }

    /// Decides whether to answer `content` from `sender` at `now`, and
    /// computes the voice to answer with. Ends by recording a received
    /// interaction for the sender.
    pub async fn decide(&self, sender: &str, content: &str, now: DateTime<Utc>) -> Decision {
        let mut probability = self.base_probability as f64;

        {
            let relationships = self.relationships.read().await;
            if let Some(profile) = relationships.get(sender) {
                probability *= 0.5 + 0.5 * profile.closeness as f64;
            }
        }

        let lowered = content.to_lowercase();
        if self
            .trigger_words
            .iter()
            .any(|word| lowered.contains(word.as_str()))
        {
            probability *= 1.2;
        }

        let time_of_day = time_of(now);
        if !self.active_hours.contains(time_of_day) {
            probability *= 0.3;
        }

        // Clamp before comparing: the trigger multiplier may overshoot 1.
        let probability = probability.clamp(0.0, 1.0);
        let draw = self.rng.lock().await.draw();
        let should_respond = draw < probability;

        let context = self.context_for(sender).await;
        self.record_interaction(sender, InteractionKind::Received)
            .await;

        tracing::debug!(
            "Decision for {}: p={:.3} draw={:.3} respond={}",
            sender,
            probability,
            draw,
            should_respond
        );

        Decision {
            should_respond,
            probability: probability as f32,
            context,
        }
    }

    /// Resolves the voice for a sender: style override or base style, trait
    /// weights adjusted per relationship, guidelines and sampled example
    /// phrases.
    pub async fn context_for(&self, sender: &str) -> DecisionContext {
        let relationships = self.relationships.read().await;
        let profile = relationships.get(sender);

        let style = profile
            .and_then(|p| p.style_override.clone())
            .unwrap_or_else(|| self.base_style.clone());
        let kind = profile.map(|p| p.kind).unwrap_or(RelationshipKind::Unknown);
        let closeness = profile.map(|p| p.closeness).unwrap_or(0.5);

        let active_traits = self.active_traits(profile).await;
        let guidelines = guidelines_for(kind);
        drop(relationships);

        let examples = self.sample_examples(&active_traits).await;

        DecisionContext {
            style,
            relationship_kind: kind,
            closeness,
            active_traits,
            guidelines,
            examples,
        }
    }

    async fn active_traits(&self, profile: Option<&RelationshipProfile>) -> BTreeMap<String, f32> {
        let traits = self.traits.read().await;
        let mut active = BTreeMap::new();
        for (name, persona_trait) in traits.iter() {
            let adjustment = profile
                .and_then(|p| p.trait_adjustments.get(name))
                .copied()
                .unwrap_or(0.0);
            active.insert(
                name.clone(),
                (persona_trait.weight + adjustment).clamp(0.0, 1.0),
            );
        }
        active
    }

    /// Up to five example phrases drawn from traits with effective weight
    /// above 0.5. Each qualifying trait contributes with probability equal to
    /// its weight, at most two of its phrases, without replacement.
    async fn sample_examples(&self, active: &BTreeMap<String, f32>) -> Vec<String> {
        let traits = self.traits.read().await;
        let mut rng = self.rng.lock().await;
        let mut examples = Vec::new();

        for (name, weight) in active {
            if *weight <= 0.5 {
                continue;
            }
            let Some(persona_trait) = traits.get(name) else {
                continue;
            };
            if rng.draw() >= *weight as f64 {
                continue;
            }

            let mut pool: Vec<&str> = persona_trait.examples.iter().map(String::as_str).collect();
            let take = pool.len().min(2);
            for _ in 0..take {
                let index = ((rng.draw() * pool.len() as f64) as usize).min(pool.len() - 1);
                examples.push(pool.swap_remove(index).to_string());
            }
        }

        examples.truncate(5);
        examples
    }

    /// Marks an interaction with `sender`. Only received messages bump the
    /// interaction count; unknown senders are left unregistered.
    pub async fn record_interaction(&self, sender: &str, kind: InteractionKind) {
        let mut relationships = self.relationships.write().await;
        if let Some(profile) = relationships.get_mut(sender) {
            profile.last_interaction = Some(Utc::now());
            if kind == InteractionKind::Received {
                profile.interaction_count += 1;
            }
        }
    }

    pub async fn relationship(&self, sender: &str) -> Option<RelationshipProfile> {
        self.relationships.read().await.get(sender).cloned()
    }

    pub async fn summary(&self) -> PersonaSummary {
        let traits = self.traits.read().await;
        PersonaSummary {
            traits: traits
                .iter()
                .map(|(name, t)| (name.clone(), t.weight))
                .collect(),
            style: self.base_style.clone(),
            relationship_count: self.relationships.read().await.len(),
            base_probability: self.base_probability,
        }
    }
}

fn time_of(now: DateTime<Utc>) -> NaiveTime {
    NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second())
        .unwrap_or(NaiveTime::MIN)
}

fn guidelines_for(kind: RelationshipKind) -> Vec<String> {
    let mut guidelines: Vec<String> = UNIVERSAL_GUIDELINES
        .iter()
        .map(|s| s.to_string())
        .collect();

    let extras: &[&str] = match kind {
        RelationshipKind::Professional => &[
            "Keep responses professional and focused",
            "Provide clear, actionable information",
        ],
        RelationshipKind::Family => &[
            "Be warm and supportive",
            "Show personal interest and care",
        ],
        RelationshipKind::Friend => &[
            "Be casual and friendly",
            "Include appropriate humor if suitable",
        ],
        RelationshipKind::Colleague | RelationshipKind::Unknown => &[],
    };
    guidelines.extend(extras.iter().map(|s| s.to_string()));
    guidelines
}

/// Stock persona traits installed when the config does not define any.
pub fn default_traits() -> Vec<PersonaTrait> {
    vec![
        PersonaTrait {
            name: "helpfulness".to_string(),
            weight: 0.8,
            description: "Tendency to help others and provide useful information".to_string(),
            examples: vec![
                "Let me help you with that".to_string(),
                "Here's what I would suggest".to_string(),
            ],
            contexts: vec![
                "work".to_string(),
                "professional".to_string(),
                "support".to_string(),
            ],
        },
        PersonaTrait {
            name: "analytical".to_string(),
            weight: 0.7,
            description: "Tendency to analyze problems systematically".to_string(),
            examples: vec![
                "Let me break this down".to_string(),
                "There are several factors to consider".to_string(),
            ],
            contexts: vec![
                "problem_solving".to_string(),
                "technical".to_string(),
                "planning".to_string(),
            ],
        },
        PersonaTrait {
            name: "friendliness".to_string(),
            weight: 0.6,
            description: "Warm and approachable communication style".to_string(),
            examples: vec![
                "Hope you're doing well!".to_string(),
                "Thanks for reaching out".to_string(),
            ],
            contexts: vec![
                "casual".to_string(),
                "social".to_string(),
                "greeting".to_string(),
            ],
        },
        PersonaTrait {
            name: "decisiveness".to_string(),
            weight: 0.5,
            description: "Ability to make clear decisions and recommendations".to_string(),
            examples: vec![
                "I'd go with option A".to_string(),
                "My recommendation would be".to_string(),
            ],
            contexts: vec![
                "decision_making".to_string(),
                "leadership".to_string(),
                "advice".to_string(),
            ],
        },
    ]
}
