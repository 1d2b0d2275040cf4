//! Scriptable in-process Moodle used by unit and edge case tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::moodle::{MoodleApi, MoodleError, MoodleResult, MoodleUser, NewMoodleUser, SiteInfo};

pub struct FakeMoodle {
    users: Mutex<HashMap<String, MoodleUser>>,
    enrollments: Mutex<HashSet<(i64, i64)>>,
    failing_users: Mutex<HashSet<i64>>,
    failing_courses: Mutex<HashSet<i64>>,
    transient_create_failures: AtomicUsize,
    next_id: AtomicI64,
    create_calls: AtomicUsize,
    enroll_calls: AtomicUsize,
}

impl FakeMoodle {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            enrollments: Mutex::new(HashSet::new()),
            failing_users: Mutex::new(HashSet::new()),
            failing_courses: Mutex::new(HashSet::new()),
            transient_create_failures: AtomicUsize::new(0),
            next_id: AtomicI64::new(100),
            create_calls: AtomicUsize::new(0),
            enroll_calls: AtomicUsize::new(0),
        }
    }

    pub async fn with_user(&self, email: &str, id: i64) {
        self.users.lock().await.insert(
            email.to_string(),
            MoodleUser {
                id,
                username: format!("user{id}"),
                email: email.to_string(),
                firstname: "Existing".to_string(),
                lastname: "User".to_string(),
                existing: false,
            },
        );
    }

    pub async fn with_enrollment(&self, user_id: i64, course_id: i64) {
        self.enrollments.lock().await.insert((user_id, course_id));
    }

    pub async fn fail_enrollments_for(&self, user_id: i64) {
        self.failing_users.lock().await.insert(user_id);
    }

    pub async fn fail_course(&self, course_id: i64) {
        self.failing_courses.lock().await.insert(course_id);
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.transient_create_failures.store(count, Ordering::SeqCst);
    }

    /// Clear every scripted failure.
    pub async fn heal(&self) {
        self.failing_users.lock().await.clear();
        self.failing_courses.lock().await.clear();
        self.transient_create_failures.store(0, Ordering::SeqCst);
    }

    pub async fn is_enrolled(&self, user_id: i64, course_id: i64) -> bool {
        self.enrollments.lock().await.contains(&(user_id, course_id))
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn enroll_calls(&self) -> usize {
        self.enroll_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MoodleApi for FakeMoodle {
    async fn find_user_by_email(&self, email: &str) -> MoodleResult<Option<MoodleUser>> {
        Ok(self.users.lock().await.get(email).cloned())
    }

    async fn create_user(&self, user: &NewMoodleUser) -> MoodleResult<MoodleUser> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.transient_create_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_create_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(MoodleError::Connection {
                reason: "connection reset".to_string(),
            });
        }

        let created = MoodleUser {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            username: user.username.clone(),
            email: user.email.clone(),
            firstname: user.firstname.clone(),
            lastname: user.lastname.clone(),
            existing: false,
        };
        self.users
            .lock()
            .await
            .insert(user.email.clone(), created.clone());
        Ok(created)
    }

    async fn enroll_user(&self, user_id: i64, course_id: i64, _role_id: i64) -> MoodleResult<()> {
        self.enroll_calls.fetch_add(1, Ordering::SeqCst);

        if self.failing_users.lock().await.contains(&user_id)
            || self.failing_courses.lock().await.contains(&course_id)
        {
            return Err(MoodleError::RemoteValidation {
                function: "enrol_manual_enrol_users".to_string(),
                code: "invalidrecord".to_string(),
                message: "course full".to_string(),
            });
        }

        self.enrollments.lock().await.insert((user_id, course_id));
        Ok(())
    }

    async fn is_user_enrolled(&self, user_id: i64, course_id: i64) -> MoodleResult<bool> {
        Ok(self.is_enrolled(user_id, course_id).await)
    }

    async fn get_site_info(&self) -> MoodleResult<SiteInfo> {
        Ok(SiteInfo {
            sitename: "Fake Moodle".to_string(),
            ..SiteInfo::default()
        })
    }
}
