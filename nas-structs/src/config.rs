use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

fn from_hyperparameters<T>(hyperparameters: &Option<Map<String, Value>>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match hyperparameters {
        Some(map) => Ok(serde_json::from_value(Value::Object(map.clone()))?),
        None => Ok(T::default()),
    }
}

/// Hyperparameters of the architecture optimizer shared by every DARTS variant.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DartsConfig {
    pub arc_learning_rate: f64,
    pub arc_betas: (f64, f64),
    pub arc_weight_decay: f64,
    pub arc_eps: f64,
    /// Seeds architecture-weight initialisation and path sampling.
    pub seed: u64,
}

impl Default for DartsConfig {
    fn default() -> Self {
        Self {
            arc_learning_rate: 3.0e-4,
            arc_betas: (0.5, 0.999),
            arc_weight_decay: 1.0e-3,
            arc_eps: 1.0e-8,
            seed: 0,
        }
    }
}

impl DartsConfig {
    pub fn from_hyperparameters(hyperparameters: &Option<Map<String, Value>>) -> Result<Self> {
        from_hyperparameters(hyperparameters)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GumbelDartsConfig {
    #[serde(flatten)]
    pub darts: DartsConfig,
    pub gumbel_temperature: f64,
    pub use_temp_anneal: bool,
    pub min_temp: f64,
}

impl Default for GumbelDartsConfig {
    fn default() -> Self {
        Self {
            darts: DartsConfig::default(),
            gumbel_temperature: 1.0,
            use_temp_anneal: false,
            min_temp: 0.33,
        }
    }
}

impl GumbelDartsConfig {
    pub fn from_hyperparameters(hyperparameters: &Option<Map<String, Value>>) -> Result<Self> {
        from_hyperparameters(hyperparameters)
    }

    /// Temperature for `epoch` out of `max_epochs`. Linear decay from
    /// `gumbel_temperature` towards `min_temp` when annealing, never below the floor.
    pub fn temperature_at(&self, epoch: usize, max_epochs: usize) -> f64 {
        if !self.use_temp_anneal || max_epochs == 0 {
            return self.gumbel_temperature;
        }
        let progress = epoch as f64 / max_epochs as f64;
        let temp = (1.0 - progress) * (self.gumbel_temperature - self.min_temp) + self.min_temp;
        temp.max(self.min_temp)
    }
}
