//! Fixtures shared by the unit tests of this crate

use frisbee_common::crd::{Lifecycle, Phase};

use crate::classifier::Classifier;
use crate::status::{ChildKind, ChildRef};

pub(crate) fn child(name: &str, phase: Phase) -> ChildRef {
    ChildRef::new(
        ChildKind::Service,
        name,
        Lifecycle {
            phase,
            ..Default::default()
        },
    )
}

/// Classifier holding `children`, each given as (name, phase)
pub(crate) fn classified(children: &[(&str, Phase)]) -> Classifier {
    let mut c = Classifier::new();
    for (name, phase) in children {
        c.classify(name, child(name, *phase));
    }
    c
}
