//! Parameter hygiene for provider quirks: clamps sampling parameters to the
//! provider's accepted range, drops fields the provider rejects, and renames
//! equivalent fields.

use crate::{RequestOverrides, Transformer};
use ccproxy_core::config::ProviderConfig;
use ccproxy_core::error::ProxyError;
use serde_json::{Value, json};

pub struct Parameters {
    temperature_min: f64,
    temperature_max: f64,
    drop: Vec<String>,
    rename: Vec<(String, String)>,
}

impl Parameters {
    pub fn from_options(options: &Value) -> Self {
        let range = options.get("temperature");
        let temperature_min = range
            .and_then(|r| r.get("min"))
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let temperature_max = range
            .and_then(|r| r.get("max"))
            .and_then(|v| v.as_f64())
            .unwrap_or(2.0);

        let drop = options
            .get("drop")
            .and_then(|d| d.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let rename = options
            .get("rename")
            .and_then(|r| r.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(from, to)| {
                        to.as_str().map(|to| (from.clone(), to.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            temperature_min,
            temperature_max,
            drop,
            rename,
        }
    }

    fn clamp_temperature(&self, obj: &mut serde_json::Map<String, Value>) {
        if let Some(temp) = obj.get("temperature").and_then(|t| t.as_f64()) {
            let clamped = temp.clamp(self.temperature_min, self.temperature_max);
            if clamped != temp {
                obj.insert("temperature".to_string(), json!(clamped));
            }
        }
    }
}

impl Transformer for Parameters {
    fn name(&self) -> &'static str {
        "parameters"
    }

    fn transform_request_in(
        &self,
        doc: &mut Value,
        _provider: &ProviderConfig,
    ) -> Result<Option<RequestOverrides>, ProxyError> {
        let Some(obj) = doc.as_object_mut() else {
            return Ok(None);
        };

        self.clamp_temperature(obj);
        if let Some(config) = obj
            .get_mut("generationConfig")
            .and_then(|c| c.as_object_mut())
        {
            self.clamp_temperature(config);
        }

        for key in &self.drop {
            obj.remove(key);
        }
        for (from, to) in &self.rename {
            if let Some(value) = obj.remove(from) {
                obj.entry(to.clone()).or_insert(value);
            }
        }
        Ok(None)
    }
}
