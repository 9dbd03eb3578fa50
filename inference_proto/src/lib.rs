mod inference {
    tonic::include_proto!("inference");
}

pub use inference::*;

use infer_parameter::ParameterChoice;

impl InferParameter {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            parameter_choice: Some(ParameterChoice::StringParam(value.into())),
        }
    }

    pub fn bool(value: bool) -> Self {
        Self {
            parameter_choice: Some(ParameterChoice::BoolParam(value)),
        }
    }

    /// Empty string when the parameter holds another type, like proto getters.
    pub fn string_param(&self) -> &str {
        match &self.parameter_choice {
            Some(ParameterChoice::StringParam(value)) => value,
            _ => "",
        }
    }

    pub fn bool_param(&self) -> bool {
        matches!(self.parameter_choice, Some(ParameterChoice::BoolParam(true)))
    }
}

impl ModelInferResponse {
    pub fn string_parameter(&self, key: &str) -> &str {
        self.parameters
            .get(key)
            .map(InferParameter::string_param)
            .unwrap_or_default()
    }
}
