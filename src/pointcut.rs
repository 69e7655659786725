use std::collections::BTreeMap;

use serde::Serialize;

/// Whether advice runs before or after its pointcut.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum AdviceTiming {
    Before,
    After,
}

/// A static advice method bound to a pointcut method.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
pub(crate) struct AdviceBinding {
    pub(crate) aspect: String,
    pub(crate) method: String,
    pub(crate) descriptor: String,
    pub(crate) timing: AdviceTiming,
}

impl AdviceBinding {
    pub(crate) fn is_before(&self) -> bool {
        self.timing == AdviceTiming::Before
    }

    pub(crate) fn is_after(&self) -> bool {
        self.timing == AdviceTiming::After
    }
}

/// Target method of one or more advice bindings, in declaration order.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct PointcutMethod {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) advice: Vec<AdviceBinding>,
}

impl PointcutMethod {
    pub(crate) fn new(name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
            advice: Vec::new(),
        }
    }

    pub(crate) fn matches(&self, name: &str, descriptor: &str) -> bool {
        self.name == name && self.descriptor == descriptor
    }

    /// Adds a binding unless an identical one is already present.
    pub(crate) fn add_advice(&mut self, binding: AdviceBinding) {
        if !self.advice.contains(&binding) {
            self.advice.push(binding);
        }
    }

    pub(crate) fn before(&self) -> impl Iterator<Item = &AdviceBinding> {
        self.advice.iter().filter(|binding| binding.is_before())
    }

    pub(crate) fn after(&self) -> impl Iterator<Item = &AdviceBinding> {
        self.advice.iter().filter(|binding| binding.is_after())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct PointcutClass {
    pub(crate) name: String,
    pub(crate) methods: Vec<PointcutMethod>,
}

impl PointcutClass {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub(crate) fn method(&self, name: &str, descriptor: &str) -> Option<&PointcutMethod> {
        self.methods
            .iter()
            .find(|method| method.matches(name, descriptor))
    }

    fn method_mut(&mut self, name: &str, descriptor: &str) -> &mut PointcutMethod {
        let index = match self
            .methods
            .iter()
            .position(|method| method.matches(name, descriptor))
        {
            Some(index) => index,
            None => {
                self.methods.push(PointcutMethod::new(name, descriptor));
                self.methods.len() - 1
            }
        };
        &mut self.methods[index]
    }
}

/// Which map a pointcut is registered in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PointcutKind {
    Call,
    Execute,
    SuperExecute,
}

/// All advice bindings of a run. Built once by the scanner, then read-only.
#[derive(Clone, Debug, Default, Serialize)]
pub(crate) struct PointcutModel {
    call: BTreeMap<String, PointcutClass>,
    execute: BTreeMap<String, PointcutClass>,
    super_execute: BTreeMap<String, PointcutClass>,
}

impl PointcutModel {
    pub(crate) fn classes(&self, kind: PointcutKind) -> &BTreeMap<String, PointcutClass> {
        match kind {
            PointcutKind::Call => &self.call,
            PointcutKind::Execute => &self.execute,
            PointcutKind::SuperExecute => &self.super_execute,
        }
    }

    pub(crate) fn class(&self, kind: PointcutKind, name: &str) -> Option<&PointcutClass> {
        self.classes(kind).get(name)
    }

    /// Execute and super-execute registrations for the same class.
    pub(crate) fn execution_classes<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a PointcutClass> + 'a {
        [PointcutKind::Execute, PointcutKind::SuperExecute]
            .into_iter()
            .filter_map(move |kind| self.class(kind, name))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.call.is_empty() && self.execute.is_empty() && self.super_execute.is_empty()
    }

    pub(crate) fn method_count(&self, kind: PointcutKind) -> usize {
        self.classes(kind)
            .values()
            .map(|class| class.methods.len())
            .sum()
    }
}

/// Mutable accumulator used while scanning; frozen into a [`PointcutModel`].
#[derive(Debug, Default)]
pub(crate) struct PointcutModelBuilder {
    model: PointcutModel,
}

impl PointcutModelBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &mut self,
        kind: PointcutKind,
        class_name: &str,
        method_name: &str,
        descriptor: &str,
        binding: AdviceBinding,
    ) {
        let map = match kind {
            PointcutKind::Call => &mut self.model.call,
            PointcutKind::Execute => &mut self.model.execute,
            PointcutKind::SuperExecute => &mut self.model.super_execute,
        };
        map.entry(class_name.to_string())
            .or_insert_with(|| PointcutClass::new(class_name))
            .method_mut(method_name, descriptor)
            .add_advice(binding);
    }

    pub(crate) fn build(self) -> PointcutModel {
        self.model
    }
}
