//! Attribute set operations used for key projection.
//!
//! These work over [`InMemDicomObject`],
//! which acts as the tag-keyed attribute container
//! for match keys, candidate matches and response identifiers.
//! Only top-level attributes are considered:
//! a selected sequence is copied as a whole.
use dicom_core::header::Header;
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

/// Check whether the attribute set contains an element with the given tag.
pub fn contains(obj: &InMemDicomObject, tag: Tag) -> bool {
    obj.element(tag).is_ok()
}

/// Collect the tags of all top-level attributes in the set.
pub fn tags_of(obj: &InMemDicomObject) -> Vec<Tag> {
    obj.into_iter().map(|e| e.tag()).collect()
}

/// Whether the attribute set has no elements.
pub fn is_empty(obj: &InMemDicomObject) -> bool {
    obj.into_iter().next().is_none()
}

/// Copy the elements of `source` whose tags are in `selection` into `target`,
/// replacing any element of `target` with the same tag.
///
/// Tags in the selection which are not present in `source` are ignored.
pub fn add_selected<I>(target: &mut InMemDicomObject, source: &InMemDicomObject, selection: I)
where
    I: IntoIterator<Item = Tag>,
{
    for tag in selection {
        if let Ok(e) = source.element(tag) {
            target.put(e.clone());
        }
    }
}

/// Create a new attribute set with the elements of `source`
/// whose tags are in `selection`.
pub fn select<I>(source: &InMemDicomObject, selection: I) -> InMemDicomObject
where
    I: IntoIterator<Item = Tag>,
{
    let mut out = InMemDicomObject::new_empty();
    add_selected(&mut out, source, selection);
    out
}

/// Obtain the tags of `selection` which are not present in `source`,
/// in ascending tag order.
pub fn not_selected(selection: &InMemDicomObject, source: &InMemDicomObject) -> Vec<Tag> {
    selection
        .into_iter()
        .map(|e| e.tag())
        .filter(|tag| !contains(source, *tag))
        .collect()
}

/// Put all elements of `source` into `target`.
/// On tag collision, the element from `source` wins.
pub fn merge(target: &mut InMemDicomObject, source: &InMemDicomObject) {
    for e in source {
        target.put(e.clone());
    }
}

/// Build the response identifier of a candidate match.
///
/// The result holds the attributes of `candidate` whose tags are present in `keys`,
/// plus _Specific Character Set_ whenever the candidate carries one
/// and it was not explicitly requested.
/// The inputs are left untouched.
pub fn project(candidate: &InMemDicomObject, keys: &InMemDicomObject) -> InMemDicomObject {
    let mut filtered = InMemDicomObject::new_empty();
    if !contains(keys, tags::SPECIFIC_CHARACTER_SET) {
        if let Ok(charset) = candidate.element(tags::SPECIFIC_CHARACTER_SET) {
            filtered.put(charset.clone());
        }
    }
    add_selected(&mut filtered, candidate, keys.into_iter().map(|e| e.tag()));
    filtered
}

/// Obtain the requested keys which the candidate does not carry,
/// excluding _Specific Character Set_.
///
/// A non-empty result means that the backend
/// could not evaluate some of the optional keys.
pub fn unsupported_keys(candidate: &InMemDicomObject, keys: &InMemDicomObject) -> Vec<Tag> {
    let mut missing = not_selected(keys, candidate);
    missing.retain(|tag| *tag != tags::SPECIFIC_CHARACTER_SET);
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{DataElement, PrimitiveValue, VR};

    fn obj(elements: &[(Tag, VR, &str)]) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(
            elements
                .iter()
                .map(|(tag, vr, v)| DataElement::new(*tag, *vr, PrimitiveValue::from(*v))),
        )
    }

    #[test]
    fn projection_keeps_requested_tags_only() {
        let keys = obj(&[
            (tags::PATIENT_ID, VR::LO, ""),
            (tags::STUDY_DATE, VR::DA, ""),
        ]);
        let candidate = obj(&[
            (tags::PATIENT_ID, VR::LO, "123"),
            (tags::STUDY_DATE, VR::DA, "20240101"),
            (tags::MODALITY, VR::CS, "CT"),
        ]);

        let rsp = project(&candidate, &keys);
        assert_eq!(
            tags_of(&rsp),
            vec![tags::STUDY_DATE, tags::PATIENT_ID]
        );
        assert_eq!(
            rsp.element(tags::PATIENT_ID).unwrap().to_str().unwrap(),
            "123"
        );
        assert!(unsupported_keys(&candidate, &keys).is_empty());
    }

    #[test]
    fn projection_adds_character_set() {
        let keys = obj(&[(tags::PATIENT_NAME, VR::PN, "")]);
        let candidate = obj(&[
            (tags::SPECIFIC_CHARACTER_SET, VR::CS, "ISO_IR 192"),
            (tags::PATIENT_NAME, VR::PN, "Doe^John"),
        ]);

        let rsp = project(&candidate, &keys);
        assert!(contains(&rsp, tags::SPECIFIC_CHARACTER_SET));
        assert!(contains(&rsp, tags::PATIENT_NAME));
    }

    #[test]
    fn character_set_never_counts_as_unsupported() {
        let keys = obj(&[
            (tags::SPECIFIC_CHARACTER_SET, VR::CS, ""),
            (tags::PATIENT_ID, VR::LO, ""),
            (tags::MODALITY, VR::CS, ""),
        ]);
        let candidate = obj(&[(tags::PATIENT_ID, VR::LO, "123")]);

        assert_eq!(unsupported_keys(&candidate, &keys), vec![tags::MODALITY]);
        // requested explicitly but absent from the candidate: not added
        assert!(!contains(&project(&candidate, &keys), tags::SPECIFIC_CHARACTER_SET));
    }

    #[test]
    fn merge_prefers_source() {
        let mut target = obj(&[
            (tags::PATIENT_ID, VR::LO, "A"),
            (tags::STUDY_INSTANCE_UID, VR::UI, "1.2.3"),
        ]);
        let source = obj(&[(tags::PATIENT_ID, VR::LO, "B")]);
        merge(&mut target, &source);
        assert_eq!(target.element(tags::PATIENT_ID).unwrap().to_str().unwrap(), "B");
        assert!(contains(&target, tags::STUDY_INSTANCE_UID));
    }

    #[test]
    fn select_ignores_absent_tags() {
        let source = obj(&[(tags::SOP_INSTANCE_UID, VR::UI, "1.2.3.4")]);
        let selected = select(
            &source,
            [tags::SOP_INSTANCE_UID, tags::SERIES_INSTANCE_UID],
        );
        assert_eq!(tags_of(&selected), vec![tags::SOP_INSTANCE_UID]);
        assert!(is_empty(&select(&source, [tags::MODALITY])));
    }
}
