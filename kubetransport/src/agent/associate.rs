use crate::kubernetes::selector_matches;
use crate::state::{Association, Pod, Service};

/// Pairs every service with the pods its selector matches, in input order.
///
/// Matching is subset semantics within the service's namespace: every
/// key/value of the selector must appear in the pod's labels, extra pod
/// labels don't disqualify. A pod backing several services shows up in each
/// of their associations. O(services x pods), which is fine at the tens to
/// low hundreds this runs at.
pub fn associate(services: Vec<Service>, pods: &[Pod]) -> Vec<Association> {
    services
        .into_iter()
        .map(|service| {
            if !service.manageable() {
                return Association {
                    service,
                    pods: vec![],
                };
            }
            let pods = pods
                .iter()
                .filter(|p| {
                    p.key.namespace == service.key.namespace
                        && selector_matches(&service.selector, &p.labels)
                })
                .cloned()
                .collect();
            Association { service, pods }
        })
        .collect()
}
