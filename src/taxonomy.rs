//! Taxonomies and the parent-topic map.
//!
//! These are configuration values, built once and handed to the labeler and
//! organizer. Nothing here is mutated at runtime.

use std::collections::HashMap;

/// Fallback for sub-topic keys missing from the parent map
pub const OTHER_PARENT: &str = "Other / Miscellaneous";

/// Which text of an entry gets embedded for matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchOn {
    #[default]
    Label,
    Definition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaxonomyEntry {
    pub label: String,
    pub definition: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Taxonomy {
    pub name: String,
    pub entries: Vec<TaxonomyEntry>,
    pub match_on: MatchOn,
}

impl Taxonomy {
    pub fn from_labels(name: &str, labels: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            entries: labels
                .iter()
                .map(|l| TaxonomyEntry { label: l.to_string(), definition: None })
                .collect(),
            match_on: MatchOn::Label,
        }
    }

    /// Error-cause taxonomy: 14 labels, each with a canonical definition
    pub fn error_causes() -> Self {
        Self {
            name: "error".to_string(),
            entries: ERROR_CAUSES
                .iter()
                .map(|(label, def)| TaxonomyEntry {
                    label: label.to_string(),
                    definition: Some(def.to_string()),
                })
                .collect(),
            match_on: MatchOn::Label,
        }
    }

    /// Category taxonomy: the parent topics
    pub fn categories() -> Self {
        Self::from_labels("category", CATEGORIES)
    }

    pub fn with_match_on(mut self, match_on: MatchOn) -> Self {
        self.match_on = match_on;
        self
    }

    pub fn labels(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.label.as_str()).collect()
    }

    /// Texts to embed, parallel to `entries`. Entries without a definition
    /// fall back to their label.
    pub fn embedding_texts(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|e| match self.match_on {
                MatchOn::Label => e.label.as_str(),
                MatchOn::Definition => e.definition.as_deref().unwrap_or(e.label.as_str()),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

const ERROR_CAUSES: &[(&str, &str)] = &[
    ("Confusion About Leave Request Submission or Approval",
     "Errors where employees were confused about how to submit leave requests, get them approved by a manager, or understand the leave request process."),
    ("Unclear FMLA or Bonding Eligibility Criteria",
     "Errors related to employees not understanding FMLA eligibility requirements, bonding eligibility criteria, or how to qualify for protected leave benefits."),
    ("Knowledge Base Articles Missing or Not Relevant",
     "Errors where employees reported that knowledge base articles were missing, outdated, incomplete, or did not address their questions effectively."),
    ("Paycheck Errors, Deductions, or Overpayment Disputes",
     "Errors involving paycheck discrepancies, incorrect deductions, overpayment issues, or disputes about payment amounts."),
    ("Inability to Access HR Systems or Forms",
     "Errors caused by employees being unable to access HR systems, forms, portals, or tools required to manage their requests."),
    ("Employees Unaware of Leave Types or Benefit Interactions",
     "Errors where employees were unaware of different leave types, how benefits interacted, or which type of leave applied to their situation."),
    ("Difficulty Providing Documentation or Verifying Identity",
     "Errors related to difficulties providing required documentation, uploading forms, or verifying their identity for leave or benefits."),
    ("Lack of Clear Rules for Leave Accrual and Usage",
     "Errors where rules for leave accrual, usage policies, or balances were not clear or consistently explained to employees."),
    ("Complex or Confusing Enrollment Processes",
     "Errors involving complex or confusing enrollment processes for benefits, dependent coverage, or qualifying events."),
    ("Unclear Disability Insurance Procedures",
     "Errors related to unclear procedures for applying for disability insurance, understanding disability benefits, or reapplying after denials."),
    ("Delays in Processing or Approving Requests",
     "Errors due to delays in processing leave requests, approvals, payments, or other time-sensitive actions by HR teams."),
    ("Region-Specific Policy or Escalation Confusion",
     "Errors stemming from inconsistent or unclear policies that vary by region, state, or business unit and cause employee confusion."),
    ("Inadequate or Vague Communication to Employees",
     "Errors where communication from HR was inadequate, vague, or missing critical details employees needed to resolve their issues."),
    ("Generic or Unclassifiable Issues",
     "Errors that could not be classified into any of the other categories due to insufficient detail or highly unusual circumstances."),
];

const CATEGORIES: &[&str] = &[
    "Payroll / Compensation",
    "Leave Management / FMLA",
    "Enrollment & Benefits",
    "Access & Technical Issues",
    "Retirement",
    "Other / Miscellaneous",
    "HR General / Operations",
    "Taxes & Withholding",
    "Disability & State Claims",
    "Verification & Documentation",
    "Timekeeping & Scheduling",
    "Job Changes & Terminations",
];

/// Grouped failure categories given to the LLM in structured analysis prompts
pub const DERIVED_ERROR_TAXONOMY: &str = "
Agent-Related Issues:
1) Lack of Knowledge
2) Incomplete Information
3) Improper Escalation
4) Lack of Empathy
5) Rushed or Abrupt Closure
6) Failure to Follow Up

Process/Content Issues:
1) Overly Complex Instructions
2) Missing Documentation
3) Technical Jargon
4) Policy Ambiguity
5) Outdated Information

System Issues:
1) Navigation Problems
2) Technical Access Failures
3) Data Mismatch
4) System Latency or Failure

Communication Issues:
1) Unclear Communication
2) Lack of Specific Guidance
3) Multiple Unrelated Issues
4) Misalignment with Caller's Needs
";

/// Closed map from upstream sub-topic keys to parent topics
#[derive(Debug, Clone, PartialEq)]
pub struct ParentTopicMap {
    map: HashMap<String, String>,
    fallback: String,
}

impl ParentTopicMap {
    pub fn new(pairs: &[(&str, &str)], fallback: &str) -> Self {
        Self {
            map: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            fallback: fallback.to_string(),
        }
    }

    pub fn builtin() -> Self {
        let pairs: Vec<(&str, &str)> = SUBTOPIC_GROUPS
            .iter()
            .flat_map(|(parent, keys)| keys.iter().map(move |k| (*k, *parent)))
            .collect();
        Self::new(&pairs, OTHER_PARENT)
    }

    /// Total: unknown keys map to the fallback
    pub fn parent_of(&self, key: &str) -> &str {
        self.map.get(key.trim()).map(|s| s.as_str()).unwrap_or(&self.fallback)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for ParentTopicMap {
    fn default() -> Self {
        Self::builtin()
    }
}

const SUBTOPIC_GROUPS: &[(&str, &[&str])] = &[
    ("Leave Management / FMLA", &[
        "-1_leave_fmla_case_status",
        "1_ir_receipt_status_fmla",
        "5_bonding_pfl_bond_ka06e0000011i5gcae",
        "7_certification_healthcare_provider_doctor",
        "15_extension_extend_proxy_continuous",
        "17_mother_care_take_family",
        "18_upload_document_doctor_fmla",
        "33_fmla_eligibility_explore_matrix",
        "46_cfra_act_right_family",
        "75_maternity_cfra_pregnancy_bonding",
        "77_colorado_co_famli_cdle_famli_info",
        "87_center_service_confusion_fmla",
        "92_ka03j000000emclcas_election_vacation_loa",
        "93_washington_dc_pfml_washingtonpaidfamilymedicalleave_default",
        "95_track_log_expiration_fmla",
        "123_pregnancy_maternity_varie_lifeevent",
        "148_doctor_fmla_paperwork_status",
        "152_transition_baby_bonding_maternity",
        "153_fmla_maryland_certification_regions",
        "159_colorado_coloradofamilymedicalleaveinsuranceprogram_coloradofamilymedicalleaveinsurance_default_co",
        "165_maternity_extension_processing_doctor",
        "169_maternity_department_promise_pregnancy",
        "204_extension_doctor_extend_25th",
        "219_maternity_revise_form_seek",
    ]),
    ("Disability & State Claims", &[
        "10_sdi_pfl_ca_family",
        "31_sdi_edd_ca_waiting",
        "43_edd_claim_ca_sdi",
        "96_edd_disability_hotline_website",
        "119_pfl_edd_www_gov",
        "138_claim_edd_www_gov",
        "205_questionnaire_extension_edd_continuous",
        "207_questionnaire_edd_fraud_claim",
    ]),
    ("Enrollment & Benefits", &[
        "4_enrollment_dependent_enroll_enrol",
        "13_cobra_equity_coverage_cost",
        "50_plan_coverage_waive_spd",
        "79_mercer_ka03j000000em3pcac_design_deduction",
        "80_cobra_package_healthequity_coverage",
        "83_mercer_deduction_administrator_aflac",
        "100_delta_dental_deltacare_usa",
        "133_parent_medicare_mother_enrol",
        "179_discount_travel_kaiser_plan",
        "193_medicare_part_ka03j000000elyfcac_enroll",
        "198_spouse_mselve_coverage_enrollment",
        "221_ppo_hmo_plan_dentist",
    ]),
    ("Payroll / Compensation", &[
        "2_discrepancy_paycheck_discrepancie_promise",
        "6_std_continuance_salary_metlife",
        "41_deposit_recall_account_payment",
        "45_specialist_increase_raise_coordinate",
        "108_cycle_payroll_payment_friday",
        "156_copy_payslip_stub_advice",
        "157_overpayment_coworker_center_occur",
        "175_paycheck_pto_payout_remain",
        "178_advance_specialist_ed_salary",
        "181_cash_payout_lbd_bsl",
        "220_overpayment_repayment_credit_notice",
    ]),
    ("Taxes & Withholding", &[
        "58_impute_deduction_income_tax",
        "65_tax_withholding_taxis_income",
        "180_irs_tax_withholding_lift",
        "55_surcharge_area_washington_reside",
    ]),
    ("Retirement", &[
        "12_retirement_center_kaiser_pension",
        "30_vanguard_contribution_fidelity_pension",
        "66_retirement_award_pension_saving",
        "69_retirement_kprc_fidelity_pension",
    ]),
    ("Timekeeping & Scheduling", &[
        "35_timecard_timekeepe_clock_recharge",
        "89_ka03j000000emhycac_return_block_schedule",
        "90_timecard_hdl_load_automate",
        "104_query_count_workforce_hour",
        "127_timekeepe_correction_coordinate_miss",
    ]),
    ("Verification & Documentation", &[
        "11_fax_email_attachment_format",
        "19_esl_ka03j000000elxacas_hospitalization_outpatient",
        "23_twn_employment_verification_resend",
        "40_ssn_birthdate_datum_name",
        "64_verification_employment_letter_assistance",
        "129_upload_marriage_certificate_assistance",
        "143_fax_receipt_document_upload",
        "161_poa_deadline_sla_validation",
        "191_baby_birth_certificate_child",
    ]),
    ("Job Changes & Terminations", &[
        "3_department_transfer_identity_terminate",
        "37_transfer_entity_unit_position",
        "86_promotion_change_data_hrar",
        "105_termination_rescind_resignation_notice",
        "111_termination_letter_june_1st",
        "120_resignation_termination_heuhzce3_v2",
        "162_position_requisition_category_planandhire",
    ]),
    ("Access & Technical Issues", &[
        "160_lcr_license_registration_calendar",
        "208_pingid_browser_edge_cache",
        "118_ppe_integration_code_base",
    ]),
    ("HR General / Operations", &[
        "8_center_service_hr_issue",
        "22_center_service_department_hr",
        "164_directory_consultant_performance_area",
    ]),
];
