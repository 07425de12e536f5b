//! Prompt text sent to the generation and vision collaborators.

/// System prompt for chat answers.
pub const CHAT_SYSTEM_PROMPT: &str = "\
You are a medical AI assistant helping doctors analyze patient records. You have access to patient medical data including documents, reports, and image transcriptions.

Guidelines:
1. Always provide accurate, helpful information based on the available data
2. If information is not available in the provided context, clearly state that
3. Highlight important medical findings, diagnoses, and treatment plans
4. Be concise but comprehensive in your responses
5. Use medical terminology appropriately but explain complex terms when helpful
6. Always prioritize patient privacy and medical ethics
7. If asked about multiple patients, provide comparative analysis when relevant
8. Reference specific documents or images when citing information
9. IMPORTANT: When patient context is set, focus only on that specific patient unless explicitly asked about others
10. For follow-up questions (like \"tell me more\", \"what else\", etc.), continue discussing the same patient from the provided context

Answer the user's question based on the provided patient data context.";

/// The active patient, as shown in the chat user prompt banner.
pub struct ActivePatient<'a> {
    pub name: &'a str,
    pub external_id: Option<&'a str>,
}

pub fn chat_user_prompt(context: &str, query: &str, active: Option<ActivePatient<'_>>) -> String {
    match active {
        Some(p) => format!(
            "CURRENT PATIENT CONTEXT: {name} (ID: {id})\n\
             This conversation is focused on this specific patient. All questions should be answered in relation to this patient unless explicitly stated otherwise.\n\n\
             Patient Data Context:\n{context}\n\n\
             User Question: {query}\n\n\
             Please provide a comprehensive answer based on the available patient information for {name}.",
            name = p.name,
            id = p.external_id.unwrap_or("N/A"),
        ),
        None => format!(
            "Patient Data Context:\n{context}\n\n\
             User Question: {query}\n\n\
             Please provide a comprehensive answer based on the available patient information."
        ),
    }
}

/// Characters of source text included in an enhancement request.
pub const ENHANCE_INPUT_CHARS: usize = 3000;
pub const ENHANCE_TEMPERATURE: f32 = 0.2;
pub const ENHANCE_MAX_TOKENS: u32 = 2000;

pub fn enhance_prompt(text: &str, file_type: &str) -> String {
    let excerpt: String = text.chars().take(ENHANCE_INPUT_CHARS).collect();
    format!(
        "Please analyze and enhance this medical {file_type} text for better organization and searchability.\n\
         Extract key medical information, standardize terminology, and create a structured summary.\n\n\
         Original text: {excerpt}\n\n\
         Please format the response with clear sections like:\n\
         - Patient Information\n\
         - Medical History\n\
         - Symptoms/Complaints\n\
         - Diagnosis\n\
         - Treatment Plan\n\
         - Follow-up\n\
         - Other Notes\n\n\
         Only include sections that have relevant information."
    )
}

pub fn vision_prompt(
    patient_name: &str,
    patient_id: &str,
    category: &str,
    clinical_context: &str,
) -> String {
    let clinical_context = if clinical_context.trim().is_empty() {
        "No additional clinical context provided"
    } else {
        clinical_context
    };
    format!(
        "You are a medical AI assistant analyzing a medical image. Please provide a detailed analysis.\n\n\
         PATIENT INFORMATION:\n\
         - Name: {patient_name}\n\
         - Patient ID: {patient_id}\n\
         - Image Type: {category}\n\n\
         CLINICAL CONTEXT:\n{clinical_context}\n\n\
         Please analyze this medical image and provide:\n\n\
         1. **Image Type & Quality Assessment:**\n\
         \x20  - What type of medical imaging is this?\n\
         \x20  - Is the image quality adequate for diagnosis?\n\n\
         2. **Anatomical Observations:**\n\
         \x20  - What anatomical structures are visible?\n\
         \x20  - Any obvious abnormalities or variations?\n\n\
         3. **Medical Findings:**\n\
         \x20  - Describe any pathological findings\n\
         \x20  - Note any areas of concern\n\
         \x20  - Identify normal vs abnormal features\n\n\
         4. **Clinical Correlation:**\n\
         \x20  - How do these findings relate to the patient's clinical context?\n\
         \x20  - What additional imaging or tests might be recommended?\n\n\
         5. **Summary:**\n\
         \x20  - Provide a concise summary of key findings\n\
         \x20  - Note any limitations in the analysis\n\n\
         Please be thorough but acknowledge that this is an AI analysis and should be reviewed by qualified medical professionals."
    )
}

pub fn summary_prompt(context: &str) -> String {
    format!(
        "Based on the following patient data, provide a comprehensive medical summary including:\n\n\
         1. Patient Demographics\n\
         2. Key Medical Conditions/Diagnoses\n\
         3. Treatment History\n\
         4. Current Status\n\
         5. Risk Factors\n\
         6. Recommendations for Further Care\n\n\
         Patient Data:\n{context}\n\n\
         Format the response in clear sections with bullet points where appropriate."
    )
}

pub fn trends_prompt(context: &str, request: Option<&str>) -> String {
    format!(
        "Analyze the following clinical database and provide insights about:\n\n\
         1. Patient Demographics and Distribution\n\
         2. Common Medical Conditions or Patterns\n\
         3. Data Quality and Completeness\n\
         4. Recommendations for Clinical Care\n\n\
         Database Information:\n{context}\n\n\
         Specific Analysis Request: {request}\n\n\
         Provide a comprehensive analysis with actionable insights.",
        request = request.unwrap_or("General overview"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompt_banner_only_with_active_patient() {
        let with = chat_user_prompt(
            "ctx",
            "what else?",
            Some(ActivePatient {
                name: "Jane Doe",
                external_id: None,
            }),
        );
        assert!(with.starts_with("CURRENT PATIENT CONTEXT: Jane Doe (ID: N/A)"));
        assert!(with.contains("patient information for Jane Doe."));

        let without = chat_user_prompt("ctx", "how many?", None);
        assert!(!without.contains("CURRENT PATIENT CONTEXT"));
        assert!(without.contains("User Question: how many?"));
    }

    #[test]
    fn enhance_prompt_limits_input() {
        let prompt = enhance_prompt(&"a".repeat(5000), "clinical_record");
        assert!(prompt.contains(&"a".repeat(ENHANCE_INPUT_CHARS)));
        assert!(!prompt.contains(&"a".repeat(ENHANCE_INPUT_CHARS + 1)));
    }

    #[test]
    fn vision_prompt_defaults_clinical_context() {
        let prompt = vision_prompt("Jane Doe", "M0007", "MRI", "  ");
        assert!(prompt.contains("- Image Type: MRI"));
        assert!(prompt.contains("No additional clinical context provided"));
    }
}
