//! Module for parsing match key terms into DICOM identifiers.
//!
//! Terms have the syntax `«tag»=«value»`,
//! where `«tag»` is either a DICOM tag group-element pair
//! or the respective tag keyword,
//! and `=«value»` is optional.
//! Multiple values are separated by `/`.
use std::str::FromStr;

use dicom_core::dictionary::DataDictionary;
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::{tags, StandardDataDictionary};
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use snafu::{OptionExt, ResultExt, Snafu};

/// Attributes read from a source descriptor file
/// when no input filter is given.
pub const DEFAULT_INPUT_FILTER: [Tag; 3] = [
    tags::SOP_INSTANCE_UID,
    tags::STUDY_INSTANCE_UID,
    tags::SERIES_INSTANCE_UID,
];

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// empty match key term
    EmptyTerm,

    #[snafu(display("could not resolve attribute `{}`", name))]
    UnknownAttribute { name: String },

    #[snafu(display("unsupported value representation {:?} for {}", vr, tag))]
    UnsupportedVr { tag: Tag, vr: VR },

    #[snafu(display("could not parse `{}` as {:?}", value, vr))]
    ParseNumber {
        value: String,
        vr: VR,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A single match key, as given on the command line.
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub struct TermQuery {
    pub field: Tag,
    pub match_value: String,
}

impl FromStr for TermQuery {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag_part, value_part) = match s.split_once('=') {
            Some((tag, value)) => (tag, value),
            None => (s, ""),
        };
        let tag_part = tag_part.trim();
        if tag_part.is_empty() {
            return EmptyTermSnafu.fail();
        }

        Ok(TermQuery {
            field: parse_tag(tag_part)?,
            match_value: value_part.to_owned(),
        })
    }
}

impl TermQuery {
    /// Turn this term into a data element,
    /// using the standard dictionary to pick the value representation.
    pub fn to_element(&self) -> Result<InMemElement> {
        term_to_element(self.field, &self.match_value)
    }
}

/// Resolve a tag expression (`(gggg,eeee)` or `gggg,eeee`)
/// or a standard attribute keyword.
pub fn parse_tag(expr: &str) -> Result<Tag> {
    expr.parse::<Tag>().or_else(|_| {
        StandardDataDictionary
            .by_name(expr)
            .map(|e| e.tag.inner())
            .context(UnknownAttributeSnafu { name: expr })
    })
}

/// Resolve a list of tag expressions or keywords,
/// as used for input filters.
pub fn parse_tags<T>(exprs: &[T]) -> Result<Vec<Tag>>
where
    T: AsRef<str>,
{
    exprs.iter().map(|e| parse_tag(e.as_ref().trim())).collect()
}

/// Extend a base identifier with the given match key terms.
///
/// Later terms override earlier ones and those already in `obj`.
pub fn parse_queries<T>(mut obj: InMemDicomObject, qs: &[T]) -> Result<InMemDicomObject>
where
    T: AsRef<str>,
{
    for q in qs {
        let term_query: TermQuery = q.as_ref().parse()?;
        obj.put(term_query.to_element()?);
    }
    Ok(obj)
}

/// Build a _Query/Retrieve Level_ element.
pub fn level_element(level: &str) -> InMemElement {
    DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        PrimitiveValue::from(level.trim().to_uppercase()),
    )
}

fn parse_values<T>(txt_value: &str, vr: VR) -> Result<dicom_core::value::C<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    txt_value
        .split('/')
        .map(|v| {
            v.trim().parse::<T>().map_err(Box::from).context(ParseNumberSnafu {
                value: v.to_owned(),
                vr,
            })
        })
        .collect()
}

fn term_to_element(tag: Tag, txt_value: &str) -> Result<InMemElement> {
    let vr = StandardDataDictionary
        .by_tag(tag)
        .map(|e| e.vr.relaxed())
        .unwrap_or(VR::LO);

    // an empty value stands for universal matching,
    // regardless of the value representation
    if txt_value.is_empty() {
        return Ok(DataElement::new(tag, vr, PrimitiveValue::Empty));
    }

    let value = match vr {
        VR::AE
        | VR::AS
        | VR::CS
        | VR::DA
        | VR::DS
        | VR::IS
        | VR::LO
        | VR::PN
        | VR::SH
        | VR::TM
        | VR::UI
        | VR::UC
        | VR::DT => {
            let values: dicom_core::value::C<String> =
                txt_value.split('/').map(str::to_owned).collect();
            if values.len() == 1 {
                PrimitiveValue::from(txt_value)
            } else {
                PrimitiveValue::Strs(values)
            }
        }
        // free text is never split into multiple values
        VR::LT | VR::ST | VR::UR | VR::UT => PrimitiveValue::from(txt_value),
        VR::SS => PrimitiveValue::I16(parse_values(txt_value, vr)?),
        VR::SL => PrimitiveValue::I32(parse_values(txt_value, vr)?),
        VR::SV => PrimitiveValue::I64(parse_values(txt_value, vr)?),
        VR::US => PrimitiveValue::U16(parse_values(txt_value, vr)?),
        VR::UL => PrimitiveValue::U32(parse_values(txt_value, vr)?),
        VR::UV => PrimitiveValue::U64(parse_values(txt_value, vr)?),
        VR::FL => PrimitiveValue::F32(parse_values(txt_value, vr)?),
        VR::FD => PrimitiveValue::F64(parse_values(txt_value, vr)?),
        VR::AT
        | VR::OB
        | VR::OD
        | VR::OF
        | VR::OL
        | VR::OV
        | VR::OW
        | VR::UN
        | VR::SQ => return UnsupportedVrSnafu { tag, vr }.fail(),
    };
    Ok(DataElement::new(tag, vr, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keyword_term() {
        let term: TermQuery = "PatientID=123".parse().unwrap();
        assert_eq!(term.field, tags::PATIENT_ID);
        assert_eq!(term.match_value, "123");
    }

    #[test]
    fn parse_tag_expression_without_value() {
        let term: TermQuery = "(0008,0060)".parse().unwrap();
        assert_eq!(term.field, tags::MODALITY);
        assert_eq!(term.match_value, "");

        let term: TermQuery = "0020,000D=1.2.3".parse().unwrap();
        assert_eq!(term.field, tags::STUDY_INSTANCE_UID);
    }

    #[test]
    fn reject_unknown_keyword() {
        assert!(matches!(
            "NotAnAttribute=1".parse::<TermQuery>(),
            Err(Error::UnknownAttribute { .. })
        ));
        assert!(matches!("=1".parse::<TermQuery>(), Err(Error::EmptyTerm)));
    }

    #[test]
    fn multiple_values_become_multi_valued_element() {
        let obj = parse_queries(
            InMemDicomObject::new_empty(),
            &["ModalitiesInStudy=CT/MR", "PatientID=1/2"],
        )
        .unwrap();
        let modalities = obj.element(tags::MODALITIES_IN_STUDY).unwrap();
        assert_eq!(modalities.vr(), VR::CS);
        assert_eq!(
            modalities.to_multi_str().unwrap().to_vec(),
            vec!["CT".to_string(), "MR".to_string()]
        );
    }

    #[test]
    fn numeric_values_are_parsed() {
        let obj = parse_queries(
            InMemDicomObject::new_empty(),
            &["NumberOfStudyRelatedInstances=12"],
        )
        .unwrap();
        let e = obj.element(tags::NUMBER_OF_STUDY_RELATED_INSTANCES).unwrap();
        assert_eq!(e.to_int::<i32>().unwrap(), 12);

        // Rows is US
        assert!(matches!(
            parse_queries(InMemDicomObject::new_empty(), &["Rows=abc"]),
            Err(Error::ParseNumber { .. })
        ));
    }

    #[test]
    fn later_terms_override() {
        let obj =
            parse_queries(InMemDicomObject::new_empty(), &["PatientID=A", "PatientID=B"]).unwrap();
        assert_eq!(obj.element(tags::PATIENT_ID).unwrap().to_str().unwrap(), "B");
    }

    #[test]
    fn input_filter_tags() {
        let filter = parse_tags(&["SOPInstanceUID", "(0020,000E)"]).unwrap();
        assert_eq!(filter, vec![tags::SOP_INSTANCE_UID, tags::SERIES_INSTANCE_UID]);
    }
}
