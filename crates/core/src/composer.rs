//! Renders step outcomes into HL7 messages.
//!
//! Composition layers values in a fixed order, each layer overwriting the previous one:
//!
//! 1. header defaults (MSH sending/receiving application and facility, processing id, version)
//! 2. generated segments built from the patient snapshot, or a hardcoded template that matches
//!    the step
//! 3. the step's explicit field `overrides`
//!
//! The composer never mutates state other than the shared control ID counter.
//!
//! Control IDs are issued when a message is composed. They are unique for the run and strictly
//! increasing within one pathway instance, because an instance sends its messages in order.
//! Concurrent instances may reach a connection in a different order than their IDs were issued;
//! every sent message is logged with its control ID, pathway and instance for tracing.

use crate::effects::Outcome;
use crate::model::{Encounter, Order, PatientRecord};
use crate::pathway::Step;
use crate::pools::Bed;
use crate::templates::{HardcodedCatalog, HardcodedTemplate};
use crate::{ComposeError, ComposeResult};
use chrono::{DateTime, Utc};
use hl7::{
    components, escape, format_date, format_datetime, HeaderConfig, Message, MessageType, Segment,
    Timezone,
};
use simhospital_ids::{ControlId, ControlIdGenerator, InstanceId};
use std::collections::HashMap;
use std::sync::Arc;

/// A rendered message ready for a sink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    /// ER7 text, segments terminated by `\r`.
    pub payload: String,
    pub control_id: ControlId,
    /// MSH-9 as rendered, e.g. `ADT^A01`.
    pub message_type: String,
    pub pathway: String,
    pub instance: InstanceId,
    pub step: usize,
}

/// Everything the composer needs to know about one executed step.
pub struct StepContext<'a> {
    pub pathway: &'a str,
    pub instance: InstanceId,
    pub step_index: usize,
    pub step: &'a Step,
    pub outcome: &'a Outcome,
    /// Snapshot taken under the patient lock after the effect was applied.
    pub record: &'a PatientRecord,
    pub now: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Composer {
    header: HeaderConfig,
    timezone: Timezone,
    templates: Arc<HardcodedCatalog>,
    control_ids: Arc<ControlIdGenerator>,
}

impl Composer {
    pub fn new(
        header: HeaderConfig,
        timezone: Timezone,
        templates: Arc<HardcodedCatalog>,
        control_ids: Arc<ControlIdGenerator>,
    ) -> Self {
        Self {
            header,
            timezone,
            templates,
            control_ids,
        }
    }

    fn timestamp(&self, instant: DateTime<Utc>) -> String {
        format_datetime(instant, &self.timezone)
    }

    /// Renders the messages for one step, in send order.
    ///
    /// # Errors
    ///
    /// Returns a [`ComposeError`] for an unknown template or placeholder, an override naming a
    /// segment the message does not contain, or an order the snapshot does not hold.
    pub fn compose(&self, ctx: &StepContext<'_>) -> ComposeResult<Vec<OutboundMessage>> {
        if *ctx.outcome == Outcome::Branch {
            return Ok(Vec::new());
        }

        let control_id = self.control_ids.next_id();
        let timestamp = self.timestamp(ctx.now);

        let mut message = match ctx.outcome {
            Outcome::Hardcoded { name } => {
                let template = self
                    .templates
                    .get(name)
                    .ok_or_else(|| ComposeError::UnknownTemplate(name.clone()))?;
                self.render_template(template, ctx, &control_id, &timestamp)?
            }
            _ => match self.templates.for_step(ctx.pathway, ctx.step.action.kind()) {
                Some(template) => self.render_template(template, ctx, &control_id, &timestamp)?,
                None => self.generate(ctx, &control_id, &timestamp)?,
            },
        };

        self.header
            .fill_defaults(&mut message, control_id.as_str(), &timestamp)?;
        for (path, value) in &ctx.step.overrides.0 {
            message.set_field(path, value.as_str())?;
        }

        let control_id = message.control_id().map(ControlId::from).unwrap_or(control_id);
        Ok(vec![OutboundMessage {
            payload: message.to_er7(),
            control_id,
            message_type: message.message_type().unwrap_or_default().to_string(),
            pathway: ctx.pathway.to_string(),
            instance: ctx.instance,
            step: ctx.step_index,
        }])
    }

    fn render_template(
        &self,
        template: &HardcodedTemplate,
        ctx: &StepContext<'_>,
        control_id: &ControlId,
        timestamp: &str,
    ) -> ComposeResult<Message> {
        let patient = &ctx.record.patient;
        let encounter = ctx.record.current_encounter();
        let values: HashMap<&str, String> = HashMap::from([
            ("MRN", escape(patient.mrn.as_str())),
            ("PATIENT_ID", patient.id.to_string()),
            ("GIVEN_NAME", escape(&patient.given_name)),
            ("FAMILY_NAME", escape(&patient.family_name)),
            ("BIRTH_DATE", format_date(patient.birth_date)),
            ("SEX", patient.sex.code().to_string()),
            ("NOW", timestamp.to_string()),
            (
                "VISIT_ID",
                encounter.map(|e| escape(&e.visit_number)).unwrap_or_default(),
            ),
            (
                "LOCATION",
                encounter
                    .and_then(|e| e.location.as_ref())
                    .map(location)
                    .unwrap_or_default(),
            ),
            ("CONTROL_ID", control_id.to_string()),
        ]);
        template.render(&values)
    }

    fn generate(
        &self,
        ctx: &StepContext<'_>,
        control_id: &ControlId,
        timestamp: &str,
    ) -> ComposeResult<Message> {
        let record = ctx.record;
        let encounter = record.current_encounter();
        let message_type = match ctx.outcome {
            Outcome::Admitted => MessageType::ADT_A01,
            Outcome::Registered => MessageType::ADT_A04,
            Outcome::Transferred => MessageType::ADT_A02,
            Outcome::Discharged => MessageType::ADT_A03,
            Outcome::PersonUpdated { .. } => MessageType::ADT_A08,
            Outcome::OrderPlaced { .. } => MessageType::ORM_O01,
            Outcome::Resulted { .. } => MessageType::ORU_R01,
            Outcome::NoteWritten { .. } => MessageType::MDM_T02,
            Outcome::Hardcoded { name } => return Err(ComposeError::UnknownTemplate(name.clone())),
            Outcome::Branch => return Ok(Message::new()),
        };

        let mut message = Message::new();
        message.push(
            self.header
                .msh(message_type, control_id.as_str(), timestamp),
        );

        match ctx.outcome {
            Outcome::OrderPlaced { key } | Outcome::Resulted { key } => {
                let encounter = encounter.ok_or_else(|| ComposeError::NoOpenEncounter {
                    mrn: record.patient.mrn.to_string(),
                })?;
                let order = encounter
                    .order(key)
                    .ok_or_else(|| ComposeError::UnknownOrder(key.clone()))?;
                message.push(self.pid(record));
                message.push(self.pv1(Some(encounter)));
                let resulted = matches!(ctx.outcome, Outcome::Resulted { .. });
                message.push(self.orc(order, resulted));
                message.push(self.obr(order, resulted));
                if resulted {
                    for segment in self.obx(order) {
                        message.push(segment);
                    }
                }
            }
            Outcome::NoteWritten { note_type, text } => {
                message.push(self.evn(message_type, timestamp));
                message.push(self.pid(record));
                message.push(self.pv1(encounter));
                message.push(
                    Segment::new("TXA")
                        .with(1, "1")
                        .with(2, escape(note_type))
                        .with(3, "TX")
                        .with(4, timestamp)
                        .with(12, control_id.as_str())
                        .with(17, "AU"),
                );
                message.push(
                    Segment::new("OBX")
                        .with(1, "1")
                        .with(2, "TX")
                        .with(3, components([note_type.as_str()]))
                        .with(5, escape(text))
                        .with(11, "F")
                        .with(14, timestamp),
                );
            }
            _ => {
                message.push(self.evn(message_type, timestamp));
                message.push(self.pid(record));
                message.push(self.pv1(encounter));
                if matches!(
                    ctx.outcome,
                    Outcome::Admitted | Outcome::Registered | Outcome::PersonUpdated { .. }
                ) {
                    for (index, allergy) in record.patient.allergies.iter().enumerate() {
                        message.push(
                            Segment::new("AL1")
                                .with(1, (index + 1).to_string())
                                .with(2, "DA")
                                .with(3, components([&allergy.id, &allergy.text])),
                        );
                    }
                }
                if let (Outcome::PersonUpdated { .. }, Some(encounter)) = (ctx.outcome, encounter)
                {
                    for (index, (diagnosis, at)) in encounter.diagnoses.iter().enumerate() {
                        message.push(
                            Segment::new("DG1")
                                .with(1, (index + 1).to_string())
                                .with(3, components([diagnosis.id.as_str(), diagnosis.text.as_str(), "ICD-10"]))
                                .with(5, self.timestamp(*at))
                                .with(6, "F"),
                        );
                    }
                    for (index, (procedure, at)) in encounter.procedures.iter().enumerate() {
                        message.push(
                            Segment::new("PR1")
                                .with(1, (index + 1).to_string())
                                .with(3, components([&procedure.id, &procedure.text]))
                                .with(5, self.timestamp(*at)),
                        );
                    }
                }
            }
        }
        Ok(message)
    }

    fn evn(&self, message_type: MessageType, timestamp: &str) -> Segment {
        Segment::new("EVN")
            .with(1, message_type.trigger)
            .with(2, timestamp)
    }

    fn pid(&self, record: &PatientRecord) -> Segment {
        let patient = &record.patient;
        let prefix = patient.prefix.as_deref().unwrap_or_default();
        let address = &patient.address;
        let mut pid = Segment::new("PID")
            .with(1, "1")
            .with(2, patient.id.to_string())
            .with(
                3,
                components([
                    patient.mrn.as_str(),
                    "",
                    "",
                    self.header.sending_facility.as_str(),
                    "MR",
                ]),
            )
            .with(
                5,
                components([
                    patient.family_name.as_str(),
                    patient.given_name.as_str(),
                    "",
                    "",
                    prefix,
                ]),
            )
            .with(7, format_date(patient.birth_date))
            .with(8, patient.sex.code())
            .with(
                11,
                components([
                    address.street.as_str(),
                    "",
                    address.city.as_str(),
                    "",
                    address.postcode.as_str(),
                    address.country.as_str(),
                ]),
            );
        if let Some(ethnicity) = &patient.ethnicity {
            pid = pid.with(22, components([&ethnicity.id, &ethnicity.text]));
        }
        pid
    }

    fn pv1(&self, encounter: Option<&Encounter>) -> Segment {
        let Some(encounter) = encounter else {
            return Segment::new("PV1").with(1, "1").with(2, "N");
        };
        let mut pv1 = Segment::new("PV1")
            .with(1, "1")
            .with(2, escape(&encounter.patient_class))
            .with(19, escape(&encounter.visit_number))
            .with(44, self.timestamp(encounter.admitted_at));
        if let Some(bed) = &encounter.location {
            pv1 = pv1.with(3, location(bed));
        }
        if let Some(bed) = &encounter.prior_location {
            pv1 = pv1.with(6, location(bed));
        }
        if let Some(doctor) = &encounter.attending {
            pv1 = pv1.with(
                7,
                components([
                    doctor.id.as_str(),
                    doctor.surname.as_str(),
                    doctor.given.as_str(),
                    "",
                    "",
                    doctor.prefix.as_str(),
                ]),
            );
        }
        if let Some(discharged_at) = encounter.discharged_at {
            pv1 = pv1.with(45, self.timestamp(discharged_at));
        }
        pv1
    }

    fn orc(&self, order: &Order, resulted: bool) -> Segment {
        let (control, status) = if resulted { ("RE", "CM") } else { ("NW", "IP") };
        Segment::new("ORC")
            .with(1, control)
            .with(2, escape(&order.placer_number))
            .with(3, escape(&order.filler_number))
            .with(5, status)
            .with(9, self.timestamp(order.ordered_at))
    }

    fn obr(&self, order: &Order, resulted: bool) -> Segment {
        let mut obr = Segment::new("OBR")
            .with(1, "1")
            .with(2, escape(&order.placer_number))
            .with(3, escape(&order.filler_number))
            .with(4, components([&order.service.id, &order.service.text]))
            .with(7, self.timestamp(order.ordered_at));
        if let (true, Some(resulted_at)) = (resulted, order.resulted_at) {
            obr = obr.with(22, self.timestamp(resulted_at)).with(25, "F");
        }
        obr
    }

    fn obx(&self, order: &Order) -> Vec<Segment> {
        let observed_at = order.resulted_at.map(|at| self.timestamp(at)).unwrap_or_default();
        order
            .observations
            .iter()
            .enumerate()
            .map(|(index, observation)| {
                let value_type = if observation.value.trim().parse::<f64>().is_ok() {
                    "NM"
                } else {
                    "ST"
                };
                Segment::new("OBX")
                    .with(1, (index + 1).to_string())
                    .with(2, value_type)
                    .with(3, components([&observation.test.id, &observation.test.text]))
                    .with(5, escape(&observation.value))
                    .with(6, escape(&observation.units))
                    .with(7, escape(&observation.reference_range))
                    .with(8, observation.abnormal_flag.as_str())
                    .with(11, "F")
                    .with(14, observed_at.as_str())
            })
            .collect()
    }
}

fn location(bed: &Bed) -> String {
    components([
        bed.point_of_care.as_str(),
        bed.room.as_str(),
        bed.bed.as_str(),
        bed.facility.as_str(),
    ])
}
