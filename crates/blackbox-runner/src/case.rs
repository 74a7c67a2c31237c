use blackbox_sim::{BlackBoxState, HarnessContext};

/// One black-box test case. The runner binds the group's node containers
/// to the case before [`TestCase::run`] and releases them afterwards.
pub trait TestCase {
    fn name(&self) -> &str;

    fn run(&self, ctx: &mut HarnessContext, state: &mut BlackBoxState) -> anyhow::Result<()>;
}

type CaseFn = dyn Fn(&mut HarnessContext, &mut BlackBoxState) -> anyhow::Result<()>;

/// A test case backed by a closure.
pub struct FnCase {
    name: String,
    body: Box<CaseFn>,
}

impl TestCase for FnCase {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &mut HarnessContext, state: &mut BlackBoxState) -> anyhow::Result<()> {
        (self.body)(ctx, state)
    }
}

/// Test cases sharing one set of provisioned node containers.
pub struct TestGroup {
    pub name: String,
    pub nodes: Vec<String>,
    pub cases: Vec<Box<dyn TestCase>>,
}

impl TestGroup {
    pub fn new<I, S>(name: impl Into<String>, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            nodes: nodes.into_iter().map(Into::into).collect(),
            cases: Vec::new(),
        }
    }

    pub fn with_case(mut self, case: impl TestCase + 'static) -> Self {
        self.cases.push(Box::new(case));
        self
    }

    pub fn case<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut HarnessContext, &mut BlackBoxState) -> anyhow::Result<()> + 'static,
    {
        self.with_case(FnCase {
            name: name.into(),
            body: Box::new(body),
        })
    }

    pub fn case_names(&self) -> Vec<&str> {
        self.cases.iter().map(|c| c.name()).collect()
    }
}
