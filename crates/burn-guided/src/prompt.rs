//! Weighted prompt specifications
//!
//! `"a cat:2|a dog"` is two prompts, `"a cat"` with weight 2 and `"a dog"`
//! with weight 1. Each `|`-separated segment may carry one `:weight`
//! suffix; segments with any other number of colons keep their whole text
//! at weight 1.

use std::str::FromStr;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PromptError {
    #[error("Malformed weight {weight:?} in prompt {segment:?}")]
    MalformedWeight { segment: String, weight: String },
}

/// One `|`-separated segment of a prompt specification
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedPrompt {
    /// Prompt text, or an image path for image targets
    pub text: String,
    /// Relative pull of this prompt, 1 when no `:weight` was given
    pub weight: f32,
}

/// Parsed prompts in input order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptSpec {
    prompts: Vec<WeightedPrompt>,
}

impl PromptSpec {
    /// Parses a prompt specification; the empty string yields no prompts
    pub fn parse(input: &str) -> Result<Self, PromptError> {
        if input.is_empty() {
            return Ok(Self::default());
        }
        let prompts = input
            .split('|')
            .map(parse_segment)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { prompts })
    }

    /// True if the specification named no prompts
    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// Number of prompts
    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    /// Prompts in input order
    pub fn iter(&self) -> impl Iterator<Item = &WeightedPrompt> {
        self.prompts.iter()
    }

    /// Prompt texts in input order
    pub fn texts(&self) -> Vec<&str> {
        self.prompts.iter().map(|p| p.text.as_str()).collect()
    }

    /// Weights in input order, parallel to [`texts`](Self::texts)
    pub fn weights(&self) -> Vec<f32> {
        self.prompts.iter().map(|p| p.weight).collect()
    }

    /// Multiplies every weight by `factor`
    pub fn scale_weights(mut self, factor: f32) -> Self {
        for prompt in &mut self.prompts {
            prompt.weight *= factor;
        }
        self
    }
}

impl FromStr for PromptSpec {
    type Err = PromptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_segment(segment: &str) -> Result<WeightedPrompt, PromptError> {
    let parts: Vec<&str> = segment.split(':').collect();
    match parts.as_slice() {
        [text, weight] => {
            let parsed = weight
                .trim()
                .parse::<f32>()
                .map_err(|_| PromptError::MalformedWeight {
                    segment: segment.to_string(),
                    weight: weight.to_string(),
                })?;
            Ok(WeightedPrompt {
                text: text.trim().to_string(),
                weight: parsed,
            })
        }
        _ => Ok(WeightedPrompt {
            text: segment.trim().to_string(),
            weight: 1.0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_prompt() {
        let spec = PromptSpec::parse("a cat").unwrap();
        assert_eq!(spec.texts(), vec!["a cat"]);
        assert_eq!(spec.weights(), vec![1.0]);
    }

    #[test]
    fn test_weighted_prompts() {
        let spec = PromptSpec::parse("a cat:2|a dog:1").unwrap();
        assert_eq!(spec.texts(), vec!["a cat", "a dog"]);
        assert_eq!(spec.weights(), vec![2.0, 1.0]);
    }

    #[test]
    fn test_unweighted_with_spaces() {
        let spec = PromptSpec::parse("a cat | a dog").unwrap();
        assert_eq!(spec.texts(), vec!["a cat", "a dog"]);
        assert_eq!(spec.weights(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_malformed_weight() {
        let err = PromptSpec::parse("x:notanumber").unwrap_err();
        assert_eq!(
            err,
            PromptError::MalformedWeight {
                segment: "x:notanumber".to_string(),
                weight: "notanumber".to_string(),
            }
        );
        assert!("a|b:".parse::<PromptSpec>().is_err());
    }

    #[test]
    fn test_empty_input_has_no_prompts() {
        let spec = PromptSpec::parse("").unwrap();
        assert!(spec.is_empty());
        assert_eq!(spec.len(), 0);
    }

    #[test]
    fn test_extra_colons_keep_text() {
        let spec = PromptSpec::parse(" a:b:c ").unwrap();
        assert_eq!(spec.texts(), vec!["a:b:c"]);
        assert_eq!(spec.weights(), vec![1.0]);
    }

    #[test]
    fn test_negative_and_padded_weights() {
        let spec = PromptSpec::parse("blurry: -0.5 |sharp:1.5").unwrap();
        assert_eq!(spec.texts(), vec!["blurry", "sharp"]);
        assert_eq!(spec.weights(), vec![-0.5, 1.5]);
    }

    #[test]
    fn test_scale_weights() {
        let spec = PromptSpec::parse("a.png:2|b.png").unwrap().scale_weights(0.5);
        assert_eq!(spec.weights(), vec![1.0, 0.5]);
    }
}
