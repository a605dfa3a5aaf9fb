//! Distribution registry: the closed set of marginal families and the
//! family each fitting backend is asked for.
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FamilyError {
    #[error("Invalid family '{0}'. Use 'binomial', 'poisson', 'gaussian', 'nb', 'zip' or 'zinb'.")]
    InvalidFamily(String),
    #[error("Family assignment has {found} entries but there are {expected} features")]
    Count { expected: usize, found: usize },
}

/// Marginal distribution assigned to a feature.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Binomial,
    Poisson,
    Gaussian,
    NegativeBinomial,
    ZeroInflatedPoisson,
    ZeroInflatedNegativeBinomial,
}

/// Family handed to the smooth additive backend. It has no zero inflation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdditiveFamily {
    Binomial,
    Poisson,
    Gaussian,
    NegativeBinomial,
}

/// Family handed to the distributional (location-scale-shape) backend.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionalFamily {
    Binomial,
    Poisson,
    Normal,
    NegativeBinomial,
    ZeroInflatedPoisson,
    ZeroInflatedNegativeBinomial,
}

impl Family {
    pub fn additive(self) -> AdditiveFamily {
        match self {
            Family::Binomial => AdditiveFamily::Binomial,
            Family::Poisson | Family::ZeroInflatedPoisson => AdditiveFamily::Poisson,
            Family::Gaussian => AdditiveFamily::Gaussian,
            Family::NegativeBinomial | Family::ZeroInflatedNegativeBinomial => {
                AdditiveFamily::NegativeBinomial
            }
        }
    }

    pub fn distributional(self) -> DistributionalFamily {
        match self {
            Family::Binomial => DistributionalFamily::Binomial,
            Family::Poisson => DistributionalFamily::Poisson,
            Family::Gaussian => DistributionalFamily::Normal,
            Family::NegativeBinomial => DistributionalFamily::NegativeBinomial,
            Family::ZeroInflatedPoisson => DistributionalFamily::ZeroInflatedPoisson,
            Family::ZeroInflatedNegativeBinomial => {
                DistributionalFamily::ZeroInflatedNegativeBinomial
            }
        }
    }

    pub fn is_zero_inflated(self) -> bool {
        matches!(self, Family::ZeroInflatedPoisson | Family::ZeroInflatedNegativeBinomial)
    }

    /// Negative binomial with or without zero inflation.
    pub fn is_negative_binomial(self) -> bool {
        matches!(self, Family::NegativeBinomial | Family::ZeroInflatedNegativeBinomial)
    }

    pub fn label(self) -> &'static str {
        match self {
            Family::Binomial => "binomial",
            Family::Poisson => "poisson",
            Family::Gaussian => "gaussian",
            Family::NegativeBinomial => "nb",
            Family::ZeroInflatedPoisson => "zip",
            Family::ZeroInflatedNegativeBinomial => "zinb",
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for Family {
    type Err = FamilyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "binomial" => Ok(Family::Binomial),
            "poisson" => Ok(Family::Poisson),
            "gaussian" => Ok(Family::Gaussian),
            "nb" | "negative-binomial" | "negative_binomial" => Ok(Family::NegativeBinomial),
            "zip" | "zero-inflated-poisson" => Ok(Family::ZeroInflatedPoisson),
            "zinb" | "zero-inflated-negative-binomial" => Ok(Family::ZeroInflatedNegativeBinomial),
            _ => Err(FamilyError::InvalidFamily(s.to_string())),
        }
    }
}

/// Family labels as supplied by the caller: one for all features or one per feature.
#[derive(Debug, Clone)]
pub enum FamilyAssignment {
    Shared(String),
    PerFeature(Vec<String>),
}

impl FamilyAssignment {
    /// Expands to one parsed family per feature.
    pub fn resolve(&self, n_features: usize) -> Result<Vec<Family>, FamilyError> {
        match self {
            FamilyAssignment::Shared(label) => {
                let family: Family = label.parse()?;
                Ok(vec![family; n_features])
            }
            FamilyAssignment::PerFeature(labels) => {
                if labels.len() != n_features {
                    return Err(FamilyError::Count { expected: n_features, found: labels.len() });
                }
                labels.iter().map(|l| l.parse::<Family>()).collect()
            }
        }
    }
}

impl From<&str> for FamilyAssignment {
    fn from(label: &str) -> Self {
        FamilyAssignment::Shared(label.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_inflated_targets() {
        assert_eq!(Family::ZeroInflatedPoisson.additive(), AdditiveFamily::Poisson);
        assert_eq!(
            Family::ZeroInflatedPoisson.distributional(),
            DistributionalFamily::ZeroInflatedPoisson
        );
        assert_eq!(
            Family::ZeroInflatedNegativeBinomial.additive(),
            AdditiveFamily::NegativeBinomial
        );
        assert_eq!(
            Family::ZeroInflatedNegativeBinomial.distributional(),
            DistributionalFamily::ZeroInflatedNegativeBinomial
        );
    }

    #[test]
    fn test_parse_labels() {
        assert_eq!("nb".parse::<Family>(), Ok(Family::NegativeBinomial));
        assert_eq!("Negative-Binomial".parse::<Family>(), Ok(Family::NegativeBinomial));
        assert_eq!("gaussian".parse::<Family>(), Ok(Family::Gaussian));
        assert_eq!(
            "weibull".parse::<Family>(),
            Err(FamilyError::InvalidFamily("weibull".to_string()))
        );
    }

    #[test]
    fn test_resolve_shared_and_per_feature() {
        let shared = FamilyAssignment::from("poisson").resolve(3).unwrap();
        assert_eq!(shared, vec![Family::Poisson; 3]);

        let per = FamilyAssignment::PerFeature(vec!["zip".into(), "gaussian".into()]);
        assert_eq!(per.resolve(2).unwrap(), vec![Family::ZeroInflatedPoisson, Family::Gaussian]);
        assert_eq!(per.resolve(3), Err(FamilyError::Count { expected: 3, found: 2 }));

        let bad = FamilyAssignment::PerFeature(vec!["zip".into(), "gamma".into()]);
        assert_eq!(bad.resolve(2), Err(FamilyError::InvalidFamily("gamma".to_string())));
    }
}
