#[derive(Debug, Clone, PartialEq)]
pub struct StreamFeature {
    pub name: String,
    pub supported: bool,
    pub description: Option<String>,
}

/// Capabilities a command stream advertises.
#[derive(Debug, Clone, Default)]
pub struct StreamFeatures {
    features: Vec<StreamFeature>,
}

impl StreamFeatures {
    pub fn new() -> Self {
        Self {
            features: Vec::new(),
        }
    }

    pub fn add(&mut self, name: &str, supported: bool, description: Option<&str>) {
        match self.features.iter_mut().find(|f| f.name == name) {
            Some(existing) => {
                existing.supported = supported;
                existing.description = description.map(str::to_string);
            }
            None => self.features.push(StreamFeature {
                name: name.to_string(),
                supported,
                description: description.map(str::to_string),
            }),
        }
    }

    pub fn with(mut self, name: &str, supported: bool, description: Option<&str>) -> Self {
        self.add(name, supported, description);
        self
    }

    pub fn is_supported(&self, feature_name: &str) -> bool {
        self.features
            .iter()
            .find(|f| f.name == feature_name)
            .map_or(false, |f| f.supported)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamFeature> {
        self.features.iter()
    }
}

pub const STREAM_FEATURE_ASYNC_COPY: &str = "async_copy";
pub const STREAM_FEATURE_HOST_FUNC: &str = "host_func";
pub const STREAM_FEATURE_HOST_TASK: &str = "host_task";
