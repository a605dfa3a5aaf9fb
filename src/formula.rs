//! Formula parsing and rendering for the mean and dispersion models.
//!
//! User formulas such as `"gene ~ cell_type + s(pseudotime, k = 10, bs = \"cr\")"`
//! are parsed once into an ordered list of typed terms. Everything downstream
//! (cell filtering, complexity overrides, fast-path detection) works on that
//! structure; text is produced again only when a fitting backend is invoked,
//! in the syntax that backend expects.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("Formula must contain at most one '~': {0}")]
    Tilde(String),
    #[error("Formula has an empty term: {0}")]
    EmptyTerm(String),
    #[error("Unbalanced parentheses in formula: {0}")]
    Parentheses(String),
    #[error("Invalid smoother term '{term}': {reason}")]
    Smoother { term: String, reason: String },
    #[error("Formula response '{found}' does not match predictor '{expected}'")]
    Response { expected: String, found: String },
}

/// A smoother `s(var, ..., k = <int>, key = value, ...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SmoothTerm {
    pub vars: Vec<String>,
    /// Basis dimension; `None` leaves the backend default.
    pub k: Option<usize>,
    /// Remaining `key = value` arguments, verbatim and in input order.
    pub options: Vec<(String, String)>,
}

impl SmoothTerm {
    fn render(&self) -> String {
        let mut args: Vec<String> = self.vars.clone();
        if let Some(k) = self.k {
            args.push(format!("k = {}", k));
        }
        args.extend(self.options.iter().map(|(key, value)| format!("{} = {}", key, value)));
        format!("s({})", args.join(", "))
    }

    /// Covariates the smoother reads, including a `by` variable.
    fn covariates(&self) -> impl Iterator<Item = &str> {
        let by = self
            .options
            .iter()
            .filter(|(key, _)| key == "by")
            .map(|(_, value)| value.trim_matches('"'));
        self.vars.iter().map(String::as_str).chain(by)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Intercept,
    /// Parametric term; interactions keep their `a:b` text.
    Linear(String),
    Smooth(SmoothTerm),
}

impl Term {
    fn covariates(&self) -> Vec<&str> {
        match self {
            Term::Intercept => Vec::new(),
            Term::Linear(name) => name.split([':', '*']).map(str::trim).collect(),
            Term::Smooth(s) => s.covariates().collect(),
        }
    }
}

/// Which smooth-model backend a formula is fitted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SmootherKind {
    Standard,
    /// Large-data optimized backend; only used when the formula has a smoother.
    LargeData,
}

impl SmootherKind {
    /// Smoothing-parameter selection method keyword for this backend.
    pub fn method(self) -> &'static str {
        match self {
            SmootherKind::Standard => "REML",
            SmootherKind::LargeData => "fREML",
        }
    }

    fn wrap(self, smooth: &str) -> String {
        match self {
            SmootherKind::Standard => format!("ga(~{}, method = \"REML\")", smooth),
            SmootherKind::LargeData => {
                format!("ba(~{}, method = \"fREML\", discrete = TRUE)", smooth)
            }
        }
    }
}

/// A parsed formula. `response` is `None` for right-hand-side-only formulas.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    pub response: Option<String>,
    pub terms: Vec<Term>,
}

impl Formula {
    /// Parses `"y ~ a + s(x, k = 10)"`, `"~ a"` or a bare right-hand side `"a + b"`.
    pub fn parse(text: &str) -> Result<Formula, FormulaError> {
        let parts: Vec<&str> = text.split('~').collect();
        let (response, rhs) = match parts.as_slice() {
            [rhs] => (None, *rhs),
            [lhs, rhs] => {
                let lhs = lhs.trim();
                ((!lhs.is_empty()).then(|| lhs.to_string()), *rhs)
            }
            _ => return Err(FormulaError::Tilde(text.to_string())),
        };

        let mut terms = Vec::new();
        for raw in split_top_level(rhs, '+').map_err(|_| FormulaError::Parentheses(text.to_string()))? {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(FormulaError::EmptyTerm(text.to_string()));
            }
            let term = if raw == "1" {
                Term::Intercept
            } else if raw.starts_with("s(") {
                Term::Smooth(parse_smooth(raw)?)
            } else if raw.contains('(') || raw.contains(')') {
                return Err(FormulaError::Smoother {
                    term: raw.to_string(),
                    reason: "only s(...) smoothers are supported".into(),
                });
            } else {
                Term::Linear(raw.to_string())
            };
            terms.push(term);
        }
        Ok(Formula { response, terms })
    }

    /// Parses a formula whose response, if any, must be `predictor`.
    pub fn parse_for(text: &str, predictor: &str) -> Result<Formula, FormulaError> {
        let formula = Formula::parse(text)?;
        match &formula.response {
            Some(found) if found != predictor => Err(FormulaError::Response {
                expected: predictor.to_string(),
                found: found.clone(),
            }),
            _ => Ok(formula),
        }
    }

    pub fn intercept_only(response: Option<&str>) -> Formula {
        Formula { response: response.map(String::from), terms: vec![Term::Intercept] }
    }

    pub fn has_smooth(&self) -> bool {
        self.terms.iter().any(|t| matches!(t, Term::Smooth(_)))
    }

    /// True when the formula has nothing but an intercept.
    pub fn is_intercept_only(&self) -> bool {
        self.terms.iter().all(|t| matches!(t, Term::Intercept))
    }

    pub fn smooth_terms(&self) -> impl Iterator<Item = &SmoothTerm> {
        self.terms.iter().filter_map(|t| match t {
            Term::Smooth(s) => Some(s),
            _ => None,
        })
    }

    /// Basis dimension of the first smoother.
    pub fn basis_dim(&self) -> Option<usize> {
        self.smooth_terms().next().and_then(|s| s.k)
    }

    /// Copy with the first smoother's basis dimension set to `k`.
    /// Later smoothers are left untouched.
    pub fn with_basis_dim(&self, k: usize) -> Formula {
        let mut out = self.clone();
        if let Some(Term::Smooth(s)) = out.terms.iter_mut().find(|t| matches!(t, Term::Smooth(_))) {
            s.k = Some(k);
        }
        out
    }

    /// Distinct covariate names referenced, in order of appearance.
    pub fn covariates(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for name in self.terms.iter().flat_map(Term::covariates) {
            if !out.iter().any(|n| n == name) {
                out.push(name.to_string());
            }
        }
        out
    }

    /// Names of the parametric terms, or `None` if any smoother is present.
    pub fn linear_names(&self) -> Option<Vec<&str>> {
        let mut names = Vec::new();
        for term in &self.terms {
            match term {
                Term::Intercept => {}
                Term::Linear(name) => names.push(name.as_str()),
                Term::Smooth(_) => return None,
            }
        }
        Some(names)
    }

    pub fn references(&self, covariate: &str) -> bool {
        self.terms.iter().any(|t| t.covariates().contains(&covariate))
    }

    /// Copy without any term that reads `covariate`; an emptied formula
    /// becomes intercept-only.
    pub fn without_covariate(&self, covariate: &str) -> Formula {
        let terms: Vec<Term> = self
            .terms
            .iter()
            .filter(|t| !t.covariates().contains(&covariate))
            .cloned()
            .collect();
        if terms.is_empty() {
            return Formula::intercept_only(self.response.as_deref());
        }
        Formula { response: self.response.clone(), terms }
    }

    fn render_with(&self, smooth: impl Fn(&[&SmoothTerm]) -> Vec<String>) -> String {
        let mut parts: Vec<String> = self
            .terms
            .iter()
            .filter_map(|t| match t {
                Term::Intercept => Some("1".to_string()),
                Term::Linear(name) => Some(name.clone()),
                Term::Smooth(_) => None,
            })
            .collect();
        let smooths: Vec<&SmoothTerm> = self.smooth_terms().collect();
        if !smooths.is_empty() {
            // an explicit intercept is implied once other terms exist
            parts.retain(|p| p != "1");
            parts.extend(smooth(&smooths));
        }
        let rhs = if parts.is_empty() { "1".to_string() } else { parts.join(" + ") };
        match &self.response {
            Some(response) => format!("{} ~ {}", response, rhs),
            None => format!("~ {}", rhs),
        }
    }

    /// Text for the smooth additive backend: parametric terms first, then `s(...)` terms.
    pub fn render_additive(&self) -> String {
        self.render_with(|smooths| smooths.iter().map(|s| s.render()).collect())
    }

    /// Text for the distributional backend, where smoothers are wrapped in
    /// the additive-term interface of the chosen smooth backend.
    pub fn render_distributional(&self, kind: SmootherKind) -> String {
        self.render_with(|smooths| {
            let joined: Vec<String> = smooths.iter().map(|s| s.render()).collect();
            vec![kind.wrap(&joined.join(" + "))]
        })
    }
}

impl std::fmt::Display for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rhs: Vec<String> = self
            .terms
            .iter()
            .map(|t| match t {
                Term::Intercept => "1".to_string(),
                Term::Linear(name) => name.clone(),
                Term::Smooth(s) => s.render(),
            })
            .collect();
        match &self.response {
            Some(response) => write!(f, "{} ~ {}", response, rhs.join(" + ")),
            None => write!(f, "~ {}", rhs.join(" + ")),
        }
    }
}

/// Mean and dispersion formula text as supplied by the caller.
#[derive(Debug, Clone)]
pub struct FormulaSpec {
    pub mean: String,
    pub dispersion: String,
}

impl FormulaSpec {
    pub fn new(mean: &str, dispersion: &str) -> Self {
        Self { mean: mean.to_string(), dispersion: dispersion.to_string() }
    }

    /// Parses both formulas. The mean formula always gets `predictor` as its
    /// response; the dispersion formula is right-hand side only.
    pub fn parse(&self, predictor: &str) -> Result<ModelFormulas, FormulaError> {
        let mut mean = Formula::parse_for(&self.mean, predictor)?;
        mean.response = Some(predictor.to_string());
        let mut dispersion = Formula::parse_for(&self.dispersion, predictor)?;
        dispersion.response = None;
        Ok(ModelFormulas { mean, dispersion })
    }
}

/// Parsed mean/dispersion pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFormulas {
    pub mean: Formula,
    pub dispersion: Formula,
}

impl ModelFormulas {
    /// Every covariate referenced by either formula.
    pub fn covariates(&self) -> Vec<String> {
        let mut names = self.mean.covariates();
        for name in self.dispersion.covariates() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Removes `covariate` from both formulas.
    pub fn without_covariate(&self, covariate: &str) -> ModelFormulas {
        let dispersion = if self.dispersion.references(covariate) {
            self.dispersion.without_covariate(covariate)
        } else {
            self.dispersion.clone()
        };
        ModelFormulas { mean: self.mean.without_covariate(covariate), dispersion }
    }

    /// Applies a complexity override to the mean formula's first smoother.
    pub fn with_basis_dim(&self, k: Option<usize>) -> ModelFormulas {
        match k {
            Some(k) => ModelFormulas { mean: self.mean.with_basis_dim(k), dispersion: self.dispersion.clone() },
            None => self.clone(),
        }
    }

    /// Resolves the smooth backend: the large-data one only when asked for
    /// and the mean formula actually has a smoother.
    pub fn smoother_kind(&self, use_large_data: bool) -> SmootherKind {
        if use_large_data && self.mean.has_smooth() {
            SmootherKind::LargeData
        } else {
            SmootherKind::Standard
        }
    }
}

/// Splits on `sep` outside parentheses and quotes.
fn split_top_level(text: &str, sep: char) -> Result<Vec<String>, ()> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;
    let mut quoted = false;

    for c in text.chars() {
        match c {
            '"' | '\'' => {
                quoted = !quoted;
                current.push(c);
            }
            '(' if !quoted => {
                depth += 1;
                current.push(c);
            }
            ')' if !quoted => {
                depth -= 1;
                if depth < 0 {
                    return Err(());
                }
                current.push(c);
            }
            c if c == sep && depth == 0 && !quoted => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(());
    }
    parts.push(current);
    Ok(parts)
}

fn parse_smooth(term: &str) -> Result<SmoothTerm, FormulaError> {
    let err = |reason: &str| FormulaError::Smoother { term: term.to_string(), reason: reason.to_string() };

    if !term.ends_with(')') {
        return Err(err("missing closing parenthesis"));
    }
    let inner = &term[2..term.len() - 1];
    let args = split_top_level(inner, ',').map_err(|_| err("unbalanced parentheses"))?;

    let mut vars = Vec::new();
    let mut k = None;
    let mut options = Vec::new();
    for arg in args {
        let arg = arg.trim();
        if arg.is_empty() {
            return Err(err("empty argument"));
        }
        match arg.split_once('=') {
            Some((key, value)) => {
                let key = key.trim();
                let value = value.trim();
                if key == "k" {
                    let parsed: usize = value.parse().map_err(|_| err("k must be a positive integer"))?;
                    if parsed == 0 {
                        return Err(err("k must be a positive integer"));
                    }
                    k = Some(parsed);
                } else {
                    options.push((key.to_string(), value.to_string()));
                }
            }
            None if options.is_empty() && k.is_none() => vars.push(arg.to_string()),
            None => return Err(err("positional argument after named arguments")),
        }
    }
    if vars.is_empty() {
        return Err(err("no variable given"));
    }
    Ok(SmoothTerm { vars, k, options })
}
